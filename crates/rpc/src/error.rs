//! Error types for the RPC engine.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// Every failure a caller can observe is one of these kinds; raw I/O errors
/// are folded into [`ConnectionError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or foreign frame. The connection it arrived on is dropped.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),

    /// Connection could not be established, or died while in use.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The connection was closed or not writable when the request was sent.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No response arrived within the caller's deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Discovery found no provider for the service.
    #[error("Service {service} unavailable: {reason}")]
    ServiceUnavailable {
        /// The service that was looked up.
        service: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// The remote handler answered with a FAIL response.
    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handler errors from the server side.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A service with this name is already published on this server.
    #[error("Service already published: {0}")]
    AlreadyPublished(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(ConnectionError::Io(err))
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connecting took longer than the configured timeout.
    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// Connection closed while calls were outstanding on it.
    #[error("Connection closed unexpectedly")]
    Closed,

    /// I/O failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// The pool or server is shutting down.
    #[error("Connection is shutting down")]
    ShuttingDown,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream does not start with the protocol magic.
    #[error("Bad magic: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic {
        /// The protocol magic.
        expected: [u8; 4],
        /// The bytes found instead.
        actual: [u8; 4],
    },

    /// Protocol version this build does not speak.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Unknown message type byte.
    #[error("Unknown message type: {0:#x}")]
    UnknownMessageType(u8),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Payload does not match the declared message type.
    #[error("Invalid {message_type} payload: {reason}")]
    InvalidPayload {
        /// The declared message type.
        message_type: &'static str,
        /// What went wrong.
        reason: String,
    },
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Unsupported codec type.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(u8),
}

/// Handler errors from server-side processing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// No implementation registered for the service or method.
    #[error("No handler registered for {0}")]
    NotFound(String),

    /// Handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler returned an error.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Convenience constructor for application-level failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
