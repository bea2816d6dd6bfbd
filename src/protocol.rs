//! JSON-RPC envelope types and inbound message classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unsupported method.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: i64, method: &str, params: Option<Value>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response for a backend-initiated request we do not support.
    pub fn method_not_found(id: i64, method: &str) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(ResponseError {
                code: CODE_METHOD_NOT_FOUND,
                message: format!("method not found: {method}"),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug)]
pub enum Message {
    /// Backend-initiated request (has both `id` and `method`).
    Request(Request),
    /// Response to one of our requests (has `id`, no `method`).
    Response(Response),
    /// Notification (has `method`, no `id`).
    Notification(Notification),
}

/// Classify one decoded frame body. A body that is not one of the three
/// envelope shapes is a malformed frame.
pub fn parse_message(body: &[u8]) -> Result<Message> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedFrame(format!("body is not valid JSON: {e}")))?;

    let has_id = json.get("id").is_some();
    let has_method = json.get("method").is_some();

    if has_id && has_method {
        let request: Request = serde_json::from_value(json)
            .map_err(|e| Error::MalformedFrame(format!("bad request envelope: {e}")))?;
        return Ok(Message::Request(request));
    }
    if has_id {
        let response: Response = serde_json::from_value(json)
            .map_err(|e| Error::MalformedFrame(format!("bad response envelope: {e}")))?;
        return Ok(Message::Response(response));
    }
    if has_method {
        let notification: Notification = serde_json::from_value(json)
            .map_err(|e| Error::MalformedFrame(format!("bad notification envelope: {e}")))?;
        return Ok(Message::Notification(notification));
    }
    Err(Error::MalformedFrame(
        "message is neither request, response, nor notification".to_string(),
    ))
}
