//! Protocol layer for the RPC engine.
//!
//! This module contains the wire protocol definitions including:
//! - Frame layout and the frame codec
//! - Request/response envelopes
//! - Payload codecs and the dynamic value type

pub mod codec;
pub mod framing;
pub mod message;
pub mod value;

pub use codec::CodecKind;
pub use framing::{Frame, FrameCodec, MessageType};
pub use message::{Message, Request, RequestId, Response, Status};
pub use value::Value;
