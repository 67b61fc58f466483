//! Logical messages exchanged between peers and their frame mapping.

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::codec::CodecKind;
use crate::protocol::framing::{Frame, MessageType};
use crate::protocol::value::Value;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sparrow_discovery::ServiceName;
use uuid::Uuid;

/// Correlation key shared by a request and its response.
pub type RequestId = String;

/// Generate a new process-unique request id.
#[must_use]
pub fn next_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}

/// A call to a remote method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    request_id: RequestId,
    service: ServiceName,
    method: String,
    parameter_types: Vec<String>,
    parameters: Vec<Value>,
}

impl Request {
    /// Create a request with a fresh id. Parameter types are derived from the
    /// values.
    pub fn new(service: ServiceName, method: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self::with_id(next_request_id(), service, method, parameters)
    }

    /// Create a request with a caller-chosen id.
    pub fn with_id(
        request_id: impl Into<RequestId>,
        service: ServiceName,
        method: impl Into<String>,
        parameters: Vec<Value>,
    ) -> Self {
        let parameter_types = parameters
            .iter()
            .map(|p| p.type_name().to_string())
            .collect();
        Self {
            request_id: request_id.into(),
            service,
            method: method.into(),
            parameter_types,
            parameters,
        }
    }

    /// Override the declared parameter types.
    #[must_use]
    pub fn with_parameter_types(mut self, parameter_types: Vec<String>) -> Self {
        self.parameter_types = parameter_types;
        self
    }

    /// The correlation id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The target service.
    #[must_use]
    pub const fn service(&self) -> &ServiceName {
        &self.service
    }

    /// The target method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Declared parameter types.
    #[must_use]
    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    /// Call arguments.
    #[must_use]
    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    /// Take the call arguments.
    #[must_use]
    pub fn into_parameters(self) -> Vec<Value> {
        self.parameters
    }
}

/// Outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The handler returned a value.
    Success,
    /// The handler failed, or the result could not be delivered.
    Fail,
}

/// The answer to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    request_id: RequestId,
    status: Status,
    data: Option<Value>,
    message: Option<String>,
}

impl Response {
    /// A SUCCESS response carrying `data`.
    pub fn success(request_id: impl Into<RequestId>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: Status::Success,
            data: Some(data),
            message: None,
        }
    }

    /// A FAIL response carrying a diagnostic message.
    pub fn fail(request_id: impl Into<RequestId>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: Status::Fail,
            data: None,
            message: Some(message.into()),
        }
    }

    /// The id of the request this answers.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Success or failure.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// The result, present iff SUCCESS.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// The diagnostic text, present iff FAIL.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Convert into the call result: data on SUCCESS, `RemoteFailure` on FAIL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemoteFailure`] if the response is a FAIL.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            Status::Success => Ok(self.data.unwrap_or(Value::Null)),
            Status::Fail => Err(Error::RemoteFailure(
                self.message.unwrap_or_else(|| "remote call failed".to_string()),
            )),
        }
    }
}

/// Envelope: a logical message before serialization / after deserialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call.
    Request(Request),
    /// The answer to a call.
    Response(Response),
    /// Keep-alive, never dispatched.
    Heartbeat,
}

impl Message {
    /// The frame type this message travels as.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Heartbeat => MessageType::Heartbeat,
        }
    }

    /// Serialize the payload with `codec` and wrap it in a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn into_frame(self, codec: CodecKind) -> Result<Frame> {
        let message_type = self.message_type();
        let payload = match &self {
            Self::Request(request) => codec.encode(request)?,
            Self::Response(response) => codec.encode(response)?,
            Self::Heartbeat => Bytes::new(),
        };
        Ok(Frame::new(codec, message_type, payload))
    }

    /// Deserialize a frame's payload according to its declared type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if the payload is not a valid
    /// message of the declared type.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.message_type {
            MessageType::Request => decode_payload(frame).map(Self::Request),
            MessageType::Response => decode_payload(frame).map(Self::Response),
            MessageType::Heartbeat if frame.payload.is_empty() => Ok(Self::Heartbeat),
            MessageType::Heartbeat => Err(ProtocolError::InvalidPayload {
                message_type: MessageType::Heartbeat.as_str(),
                reason: "non-empty heartbeat".to_string(),
            }
            .into()),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    frame.codec.decode(&frame.payload).map_err(|e| {
        ProtocolError::InvalidPayload {
            message_type: frame.message_type.as_str(),
            reason: e.to_string(),
        }
        .into()
    })
}
