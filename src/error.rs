use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, time::Duration};
use thiserror::Error;

use crate::registry::Capability;

/// JSON-RPC and MCP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError,
    /// The JSON sent is not a valid request object
    InvalidRequest,
    /// The method does not exist or is not available
    MethodNotFound,
    /// Invalid method parameters
    InvalidParams,
    /// Internal JSON-RPC error
    InternalError,
    /// The requested resource does not exist
    ResourceNotFound,
    /// Generic failure of an otherwise well-formed request
    RequestFailed,
    /// Any other application-defined code
    Custom(i32),
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ResourceNotFound => -32002,
            ErrorCode::RequestFailed => -32000,
            ErrorCode::Custom(code) => code,
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32002 => ErrorCode::ResourceNotFound,
            -32000 => ErrorCode::RequestFailed,
            other => ErrorCode::Custom(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i32::from(*self))
    }
}

/// The way an inbound payload broke the JSON-RPC envelope rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolViolation {
    /// The payload was not valid JSON
    MalformedJson,
    /// Valid JSON, but not a valid JSON-RPC 2.0 message
    InvalidEnvelope,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::MalformedJson => write!(f, "malformed JSON"),
            ProtocolViolation::InvalidEnvelope => write!(f, "invalid envelope"),
        }
    }
}

/// Why a pending request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// The session is shutting down
    SessionClosing,
    /// The underlying transport failed or reached end of stream
    TransportClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::SessionClosing => write!(f, "session closing"),
            CancelReason::TransportClosed => write!(f, "transport closed"),
        }
    }
}

/// Errors produced by the engine
#[derive(Debug, Error)]
pub enum Error {
    /// The channel to the peer is broken
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded
    #[error("protocol error ({violation}): {message}")]
    Protocol {
        violation: ProtocolViolation,
        message: String,
    },

    /// The peer answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// The initialize exchange failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No response arrived within the request's deadline
    #[error("request '{method}' timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    /// The request was abandoned before a response arrived
    #[error("request cancelled: {0}")]
    Cancelled(CancelReason),

    /// The operation is not allowed in the session's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Arguments were rejected before anything was sent
    #[error("validation failed: {0}")]
    Validation(String),

    /// The capability was not part of the negotiated set
    #[error("capability '{0}' was not negotiated")]
    NotNegotiated(Capability),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates an error carrying a JSON-RPC error code
    pub fn rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::Protocol {
            violation: ProtocolViolation::MalformedJson,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_envelope(message: impl Into<String>) -> Self {
        Error::Protocol {
            violation: ProtocolViolation::InvalidEnvelope,
            message: message.into(),
        }
    }

    /// Classifies the error for callers that do not care about the details
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Protocol { .. } | Error::Serialization(_) => ErrorKind::Protocol,
            Error::Rpc { code, .. } => match code {
                ErrorCode::MethodNotFound => ErrorKind::MethodNotFound,
                ErrorCode::InvalidParams => ErrorKind::Validation,
                _ => ErrorKind::Application,
            },
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotNegotiated(_) => ErrorKind::NotNegotiated,
            Error::Other(_) => ErrorKind::Application,
        }
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Other(message.to_string())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Other(message)
    }
}

/// Coarse error classification exposed to embedding layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Handshake,
    Timeout,
    MethodNotFound,
    Validation,
    Application,
    Cancelled,
    InvalidState,
    DuplicateRegistration,
    NotNegotiated,
}

/// Host-neutral error value.
///
/// Bindings convert this into whatever error representation their runtime uses;
/// the engine itself never assumes one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// JSON-RPC code, when the error came from (or maps onto) a wire error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        let (code, data) = match err {
            Error::Rpc { code, data, .. } => (Some(i32::from(*code)), data.clone()),
            _ => (None, None),
        };
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
            code,
            data,
        }
    }
}

impl From<Error> for ErrorInfo {
    fn from(err: Error) -> Self {
        ErrorInfo::from(&err)
    }
}
