//! Message framing for the wire protocol.
//!
//! ```text
//! +---------+---------+---------+---------+-------------+-----------------+
//! | magic   | version | codec   | type    | length      | payload         |
//! | 4 bytes | 1 byte  | 1 byte  | 1 byte  | 4 bytes, BE | `length` bytes  |
//! +---------+---------+---------+---------+-------------+-----------------+
//! ```

use crate::error::{Error, ProtocolError};
use crate::protocol::codec::CodecKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol identifier at the start of every frame.
pub const MAGIC: [u8; 4] = *b"SPRW";

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size (magic + version + codec + type + length).
pub const FRAME_HEADER_SIZE: usize = 11;

/// Maximum payload size (8MB by default).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Type of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Request frame.
    Request = 0,
    /// Response frame.
    Response = 1,
    /// Heartbeat frame, always empty.
    Heartbeat = 2,
}

impl MessageType {
    /// Lowercase name used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Heartbeat),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Codec the payload was serialized with.
    pub codec: CodecKind,
    /// Type of message in the payload.
    pub message_type: MessageType,
    /// Serialized envelope.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(codec: CodecKind, message_type: MessageType, payload: Bytes) -> Self {
        Self {
            codec,
            message_type,
            payload,
        }
    }

    /// Create an empty heartbeat frame.
    #[must_use]
    pub const fn heartbeat(codec: CodecKind) -> Self {
        Self::new(codec, MessageType::Heartbeat, Bytes::new())
    }

    /// Total encoded size of this frame.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Codec for encoding/decoding frames.
///
/// Decoding never consumes bytes of a frame that is not yet complete, and
/// never consumes anything when the header is invalid.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject foreign streams as soon as the bytes we have disagree
        let seen = buf.len().min(MAGIC.len());
        if buf[..seen] != MAGIC[..seen] {
            let mut actual = [0u8; 4];
            actual[..seen].copy_from_slice(&buf[..seen]);
            return Err(ProtocolError::BadMagic {
                expected: MAGIC,
                actual,
            }
            .into());
        }

        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[MAGIC.len()..FRAME_HEADER_SIZE];
        let version = header.get_u8();
        let codec_id = header.get_u8();
        let type_byte = header.get_u8();
        let payload_len = header.get_u32() as usize;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }
        let codec = CodecKind::try_from(codec_id)?;
        let message_type = MessageType::try_from(type_byte)?;
        self.check_size(payload_len)?;

        if message_type == MessageType::Heartbeat && payload_len != 0 {
            return Err(ProtocolError::InvalidPayload {
                message_type: message_type.as_str(),
                reason: format!("heartbeat carries {payload_len} bytes"),
            }
            .into());
        }

        // Check if we have the full frame
        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            codec,
            message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        self.check_size(payload_len)?;
        let length = u32::try_from(payload_len).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload_len,
            max: u32::MAX as usize,
        })?;

        buf.reserve(frame.encoded_len());

        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(frame.codec.id());
        buf.put_u8(frame.message_type as u8);
        buf.put_u32(length);
        buf.put(frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(Frame::new(
            CodecKind::Cbor,
            MessageType::Response,
            Bytes::from_static(b"abc"),
        ));

        assert_eq!(&buf[..4], b"SPRW");
        assert_eq!(buf[4], PROTOCOL_VERSION);
        assert_eq!(buf[5], CodecKind::Cbor.id());
        assert_eq!(buf[6], 1);
        assert_eq!(&buf[7..11], &[0, 0, 0, 3]);
        assert_eq!(&buf[11..], b"abc");
    }

    #[test]
    fn test_reencode_reproduces_bytes() {
        for message_type in [MessageType::Request, MessageType::Response] {
            for size in [0usize, 1, 65536] {
                let payload = Bytes::from(vec![0xA5; size]);
                let original = encode(Frame::new(CodecKind::Bincode, message_type, payload));

                let mut buf = original.clone();
                let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
                assert!(buf.is_empty());

                assert_eq!(encode(decoded), original);
            }
        }

        let original = encode(Frame::heartbeat(CodecKind::Bincode));
        let mut buf = original.clone();
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(encode(decoded), original);
    }

    #[test]
    fn test_partial_frame_is_not_consumed() {
        let full = encode(Frame::new(
            CodecKind::Bincode,
            MessageType::Request,
            Bytes::from_static(b"Hello, World!"),
        ));
        let mut codec = FrameCodec::new();

        for cut in [3, FRAME_HEADER_SIZE - 1, FRAME_HEADER_SIZE, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_bad_magic_leaves_buffer_untouched() {
        let valid = encode(Frame::heartbeat(CodecKind::Bincode));
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        buf.extend_from_slice(&valid);
        let before = buf.len();

        let result = FrameCodec::new().decode(&mut buf);

        assert_matches!(
            result,
            Err(Error::ProtocolViolation(ProtocolError::BadMagic { .. }))
        );
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_bad_magic_detected_before_full_header() {
        let mut buf = BytesMut::from(&b"SPX"[..]);
        assert!(FrameCodec::new().decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = encode(Frame::heartbeat(CodecKind::Bincode));
        buf[4] = 9;

        assert_matches!(
            FrameCodec::new().decode(&mut buf),
            Err(Error::ProtocolViolation(ProtocolError::UnsupportedVersion(9)))
        );
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut buf = encode(Frame::heartbeat(CodecKind::Bincode));
        buf[6] = 7;

        assert_matches!(
            FrameCodec::new().decode(&mut buf),
            Err(Error::ProtocolViolation(ProtocolError::UnknownMessageType(7)))
        );
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::new().with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(CodecKind::Bincode.id());
        buf.put_u8(MessageType::Request as u8);
        buf.put_u32(17);

        assert_matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(ProtocolError::FrameTooLarge { size: 17, max: 16 }))
        );

        let oversized = Frame::new(
            CodecKind::Bincode,
            MessageType::Request,
            Bytes::from(vec![0; 17]),
        );
        assert!(codec.encode(oversized, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_heartbeat_with_payload_rejected() {
        let mut buf = encode(Frame::new(
            CodecKind::Bincode,
            MessageType::Heartbeat,
            Bytes::from_static(b"x"),
        ));

        assert_matches!(
            FrameCodec::new().decode(&mut buf),
            Err(Error::ProtocolViolation(ProtocolError::InvalidPayload { .. }))
        );
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode(Frame::new(
            CodecKind::Json,
            MessageType::Request,
            Bytes::from_static(b"one"),
        ));
        buf.extend_from_slice(&encode(Frame::heartbeat(CodecKind::Json)));
        let mut codec = FrameCodec::new();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.message_type, MessageType::Heartbeat);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_split_delivery_decodes_same_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            split in 0usize..2100,
            response in any::<bool>(),
        ) {
            let message_type = if response { MessageType::Response } else { MessageType::Request };
            let frame = Frame::new(CodecKind::Cbor, message_type, Bytes::from(payload));
            let bytes = encode(frame.clone());
            let split = split.min(bytes.len());

            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::from(&bytes[..split]);
            let early = codec.decode(&mut buf).unwrap();
            if split < bytes.len() {
                prop_assert!(early.is_none());
                buf.extend_from_slice(&bytes[split..]);
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                prop_assert_eq!(decoded, frame);
            } else {
                prop_assert_eq!(early.unwrap(), frame);
            }
            prop_assert!(buf.is_empty());
        }
    }
}
