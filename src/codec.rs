//! JSON-RPC 2.0 message codec
//!
//! [`encode`] turns a [`Message`] into its canonical wire text and [`decode`]
//! validates an inbound frame before anything is dispatched. Both are pure.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::{
    error::Error,
    protocol::{ErrorResponse, Message, Notification, Request, RequestId, Response, JSONRPC_VERSION},
};

/// Serializes a message into a single JSON-RPC frame (no trailing newline)
pub fn encode(message: &Message) -> Result<Bytes, Error> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Parses and validates one inbound frame
pub fn decode(frame: &[u8]) -> Result<Message, Error> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| Error::malformed(e.to_string()))?;
    let object = match value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(Error::invalid_envelope("batch messages are not supported")),
        other => {
            return Err(Error::invalid_envelope(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            )))
        }
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => {
            return Err(Error::invalid_envelope(format!(
                "unsupported jsonrpc version {other}"
            )))
        }
        None => return Err(Error::invalid_envelope("missing 'jsonrpc' field")),
    }

    if object.contains_key("method") {
        decode_call(object)
    } else {
        decode_reply(object)
    }
}

/// Recovers the id of a request whose envelope failed validation, so the
/// peer can be told which of its requests was rejected.
pub fn salvage_request_id(frame: &[u8]) -> Option<RequestId> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("method") {
        return None;
    }
    parse_id(object.get("id")?).ok()
}

fn decode_call(mut object: Map<String, Value>) -> Result<Message, Error> {
    let method = match object.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => return Err(Error::invalid_envelope("'method' must be a non-empty string")),
    };
    let params = match object.remove("params") {
        None => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(other) => {
            return Err(Error::invalid_envelope(format!(
                "'params' must be an object or array, got {}",
                type_name(&other)
            )))
        }
    };
    if object.contains_key("result") || object.contains_key("error") {
        return Err(Error::invalid_envelope(
            "a request must not carry 'result' or 'error'",
        ));
    }

    match object.get("id") {
        None => Ok(Message::Notification(Notification::new(method, params))),
        Some(id) => Ok(Message::Request(Request::new(method, params, parse_id(id)?))),
    }
}

fn decode_reply(mut object: Map<String, Value>) -> Result<Message, Error> {
    let result = object.remove("result");
    let error = object.remove("error");
    let id = object.get("id");

    match (result, error) {
        (Some(_), Some(_)) => Err(Error::invalid_envelope(
            "a response must not carry both 'result' and 'error'",
        )),
        (None, None) => Err(Error::invalid_envelope(
            "message has neither 'method', 'result' nor 'error'",
        )),
        (Some(result), None) => {
            let id = id.ok_or_else(|| Error::invalid_envelope("response is missing 'id'"))?;
            Ok(Message::Response(Response::success(parse_id(id)?, result)))
        }
        (None, Some(error)) => {
            let id = match id {
                None | Some(Value::Null) => None,
                Some(id) => Some(parse_id(id)?),
            };
            let error = serde_json::from_value(error)
                .map_err(|e| Error::invalid_envelope(format!("malformed error object: {e}")))?;
            Ok(Message::Error(ErrorResponse::new(id, error)))
        }
    }
}

fn parse_id(id: &Value) -> Result<RequestId, Error> {
    match id {
        Value::String(s) => Ok(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| Error::invalid_envelope(format!("request id {n} is not an integer"))),
        other => Err(Error::invalid_envelope(format!(
            "request id must be a string or integer, got {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
