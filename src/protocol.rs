use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, ErrorCode};

/// The latest supported protocol version of MCP
///
/// This is the version a session offers during the handshake unless its
/// configuration says otherwise.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// List of all protocol versions supported by this crate
///
/// A handshake is only accepted when the peer settles on one of these. The
/// versions are listed in order of preference, most recent first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[LATEST_PROTOCOL_VERSION, "2024-11-05", "2024-10-07"];

/// JSON-RPC version used by the MCP protocol
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names used on the wire
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "notifications/exit";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PROGRESS: &str = "notifications/progress";
    /// Older spelling of [`PROGRESS`], accepted on input only
    pub const PROGRESS_LEGACY: &str = "$/progress";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const LOGGING_MESSAGE: &str = "notifications/message";
}

/// A unique identifier for a request
///
/// Either a string or an integer, as per JSON-RPC 2.0. Ids generated by this
/// crate are always integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String representation of the request ID
    String(String),
    /// Numeric representation of the request ID
    Number(i64),
}

/// Base JSON-RPC request structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the method to be invoked
    pub method: String,
    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Unique identifier for the request
    pub id: RequestId,
}

/// Base JSON-RPC notification structure
///
/// Similar to a request but without an id, as it does not expect a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the method to be invoked
    pub method: String,
    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Successful JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// ID of the request this response corresponds to
    pub id: RequestId,
    /// The result of the request
    pub result: Value,
}

/// Failed JSON-RPC response
///
/// The id is `null` on the wire when the failing request could not be parsed
/// far enough to recover one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// ID of the request this response corresponds to
    pub id: Option<RequestId>,
    /// What went wrong
    pub error: ResponseError,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// The error code
    pub code: i32,
    /// A short description of the error
    pub message: String,
    /// Additional information about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any JSON-RPC message exchanged on a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
    Error(ErrorResponse),
}

impl Request {
    /// Creates a new Request instance
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

impl Notification {
    /// Creates a new Notification instance
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    /// Creates a new successful Response instance
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

impl ErrorResponse {
    /// Creates a new error response for the given request id
    pub fn new(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }
}

impl Message {
    /// The method name, for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) | Message::Error(_) => None,
        }
    }

    /// The request id, for everything except notifications
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => e.id.as_ref(),
            Message::Notification(_) => None,
        }
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Error::Rpc {
            code: ErrorCode::from(err.code),
            message: err.message,
            data: err.data,
        }
    }
}

impl From<Error> for ResponseError {
    fn from(err: Error) -> Self {
        match err {
            Error::Rpc {
                code,
                message,
                data,
            } => ResponseError {
                code: code.into(),
                message,
                data,
            },
            Error::Validation(msg) => ResponseError::new(ErrorCode::InvalidParams, msg),
            Error::Protocol { message, .. } => {
                ResponseError::new(ErrorCode::InvalidRequest, message)
            }
            Error::Serialization(err) => ResponseError::new(ErrorCode::InvalidParams, err.to_string()),
            Error::NotNegotiated(capability) => ResponseError::new(
                ErrorCode::MethodNotFound,
                format!("capability '{capability}' was not negotiated"),
            ),
            Error::Transport(msg) => ResponseError::new(
                ErrorCode::InternalError,
                format!("Transport error: {}", msg),
            ),
            other => ResponseError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_creation() {
        let id = RequestId::Number(1);
        let params = Some(json!({"key": "value"}));
        let request = Request::new("test_method", params.clone(), id.clone());

        assert_eq!(request.jsonrpc, JSONRPC_VERSION);
        assert_eq!(request.method, "test_method");
        assert_eq!(request.params, params);
        assert_eq!(request.id, id);
    }

    #[test]
    fn test_notification_creation() {
        let params = Some(json!({"event": "update"}));
        let notification = Notification::new("test_event", params.clone());

        assert_eq!(notification.jsonrpc, JSONRPC_VERSION);
        assert_eq!(notification.method, "test_event");
        assert_eq!(notification.params, params);
    }

    #[test]
    fn test_response_success() {
        let id = RequestId::String("test-1".to_string());
        let response = Response::success(id.clone(), json!({"status": "ok"}));

        assert_eq!(response.jsonrpc, JSONRPC_VERSION);
        assert_eq!(response.id, id);
        assert_eq!(response.result, json!({"status": "ok"}));
    }

    #[test]
    fn test_response_error() {
        let id = RequestId::Number(123);
        let error = ResponseError {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: Some(json!({"details": "missing method"})),
        };
        let response = ErrorResponse::new(Some(id.clone()), error.clone());

        assert_eq!(response.jsonrpc, JSONRPC_VERSION);
        assert_eq!(response.id, Some(id));
        assert_eq!(response.error, error);
    }

    #[test]
    fn test_request_id_display() {
        let num_id = RequestId::Number(42);
        let str_id = RequestId::String("test-id".to_string());

        assert_eq!(num_id.to_string(), "42");
        assert_eq!(str_id.to_string(), "test-id");
    }

    #[test]
    fn test_protocol_versions() {
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&LATEST_PROTOCOL_VERSION));
        assert_eq!(JSONRPC_VERSION, "2.0");
    }

    #[test]
    fn test_local_errors_map_to_rpc_codes() {
        let err: ResponseError = Error::Validation("age must be >= 0".into()).into();
        assert_eq!(err.code, -32602);

        let err: ResponseError = Error::Other("boom".into()).into();
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "boom");

        let err: ResponseError = Error::rpc(ErrorCode::ResourceNotFound, "gone").into();
        assert_eq!(err.code, -32002);
    }

    #[test]
    fn test_message_accessors() {
        let msg = Message::Request(Request::new("ping", None, RequestId::Number(3)));
        assert_eq!(msg.method(), Some("ping"));
        assert_eq!(msg.id(), Some(&RequestId::Number(3)));

        let msg = Message::Error(ErrorResponse::new(
            None,
            ResponseError::new(ErrorCode::ParseError, "bad json"),
        ));
        assert_eq!(msg.method(), None);
        assert_eq!(msg.id(), None);
    }
}
