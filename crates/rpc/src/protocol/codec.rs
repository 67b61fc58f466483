//! Payload serialization codecs selectable per frame.

use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Serialization codec identified by the frame's codec byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecKind {
    /// Compact binary encoding via bincode.
    #[default]
    Bincode = 1,
    /// CBOR via ciborium.
    Cbor = 2,
    /// JSON, mostly useful for debugging captures.
    Json = 3,
}

impl CodecKind {
    /// The codec identifier written into frame headers.
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Encode a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Bytes> {
        let vec = match self {
            Self::Bincode => bincode::serialize(value)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()))?,
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(value, &mut vec)
                    .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
                vec
            }
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()))?,
        };
        Ok(Bytes::from(vec))
    }

    /// Decode bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid for this codec.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        let value = match self {
            Self::Bincode => bincode::deserialize(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?,
            Self::Cbor => ciborium::de::from_reader(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?,
            Self::Json => serde_json::from_slice(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?,
        };
        Ok(value)
    }
}

impl TryFrom<u8> for CodecKind {
    type Error = CodecError;

    fn try_from(value: u8) -> std::result::Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Bincode),
            2 => Ok(Self::Cbor),
            3 => Ok(Self::Json),
            other => Err(CodecError::UnsupportedCodec(other)),
        }
    }
}
