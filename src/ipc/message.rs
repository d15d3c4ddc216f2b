//! JSON-RPC 2.0 message types.
//!
//! Messages are classified structurally, not by an explicit kind field:
//! an `error` key wins over a `result` key, which wins over a bare `id`.
//! A payload with only a `method` is a notification.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{RpcError, RpcResult};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes, plus the application codes this client
/// answers with.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Inbound call named a session this client does not know.
    pub const SESSION_NOT_FOUND: i64 = -32001;
    /// Session exists but has no handler for the call.
    pub const HANDLER_NOT_REGISTERED: i64 = -32002;
}

/// A request id. The server may use numbers or strings.
///
/// Numbers are kept as decoded, so ids beyond `i64` or with a fraction are
/// echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    /// Canonical string form used as the correlation key.
    ///
    /// `1` and `"1"` share the key `"1"`.
    pub fn key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::Number(n.clone()),
            RequestId::String(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// One JSON-RPC message, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    ErrorResponse {
        id: RequestId,
        error: ErrorObject,
    },
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response { id, result }
    }

    pub fn error_response(id: RequestId, error: ErrorObject) -> Self {
        Message::ErrorResponse { id, error }
    }

    /// The id, for everything but notifications.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::ErrorResponse { id, .. } => Some(id),
            Message::Notification { .. } => None,
        }
    }

    /// The method, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } | Message::ErrorResponse { .. } => None,
        }
    }

    /// Parse a payload string.
    pub fn parse(text: &str) -> RpcResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RpcError::Protocol(format!("Invalid JSON payload: {}", e)))?;
        Self::from_value(value)
    }

    /// Classify an already-decoded JSON value.
    pub fn from_value(value: Value) -> RpcResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(RpcError::Protocol(
                "Message must be a JSON object".to_string(),
            ));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|e| RpcError::Protocol(format!("Invalid id: {}", e)))?,
            ),
        };

        if let Some(error) = obj.remove("error") {
            let id = id.ok_or_else(|| {
                RpcError::Protocol("Error response without id".to_string())
            })?;
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| RpcError::Protocol(format!("Invalid error object: {}", e)))?;
            return Ok(Message::ErrorResponse { id, error });
        }

        if let Some(result) = obj.remove("result") {
            let id =
                id.ok_or_else(|| RpcError::Protocol("Response without id".to_string()))?;
            return Ok(Message::Response { id, result });
        }

        let method = match obj.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(RpcError::Protocol("Method must be a string".to_string())),
            None => {
                return Err(RpcError::Protocol(
                    "Message has no method, result or error".to_string(),
                ))
            }
        };
        let params = obj.remove("params").filter(|p| !p.is_null());

        Ok(match id {
            Some(id) => Message::Request { id, method, params },
            None => Message::Notification { method, params },
        })
    }

    /// Build the wire JSON value.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".to_string(), id.to_value());
                obj.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Notification { method, params } => {
                obj.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Response { id, result } => {
                obj.insert("id".to_string(), id.to_value());
                obj.insert("result".to_string(), result.clone());
            }
            Message::ErrorResponse { id, error } => {
                obj.insert("id".to_string(), id.to_value());
                // ErrorObject serialization cannot fail: only strings, ints and Values
                let error = serde_json::to_value(error).unwrap_or(Value::Null);
                obj.insert("error".to_string(), error);
            }
        }

        Value::Object(obj)
    }

    /// Serialize to a payload string.
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn roundtrip(message: Message) {
        let text = message.serialize();
        let parsed = Message::parse(&text).expect("parse failed");
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_roundtrip_each_variant() {
        roundtrip(Message::request("1", "ping", Some(json!({"message": "hi"}))));
        roundtrip(Message::notification("session.event", Some(json!({"sessionId": "abc"}))));
        roundtrip(Message::response(RequestId::from(7i64), json!({"message": "pong"})));
        roundtrip(Message::error_response(
            RequestId::from("x"),
            ErrorObject::new(error_codes::METHOD_NOT_FOUND, "nope").with_data(json!([1, 2])),
        ));
    }

    #[test]
    fn test_error_wins_over_result() {
        let parsed = Message::parse(
            r#"{"jsonrpc":"2.0","id":3,"result":{},"error":{"code":-1,"message":"bad"}}"#,
        )
        .unwrap();
        assert!(matches!(parsed, Message::ErrorResponse { .. }));
    }

    #[test]
    fn test_result_wins_over_method() {
        let parsed =
            Message::parse(r#"{"jsonrpc":"2.0","id":3,"method":"x","result":null}"#).unwrap();
        assert_eq!(parsed, Message::response(RequestId::from(3i64), Value::Null));
    }

    #[test]
    fn test_request_vs_notification() {
        let req = Message::parse(r#"{"jsonrpc":"2.0","id":"a","method":"tool.call"}"#).unwrap();
        assert_eq!(req, Message::request("a", "tool.call", None));

        let note = Message::parse(r#"{"jsonrpc":"2.0","method":"session.event","params":{}}"#)
            .unwrap();
        assert_eq!(note, Message::notification("session.event", Some(json!({}))));

        // A null id is a notification, not a request
        let note = Message::parse(r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#).unwrap();
        assert!(matches!(note, Message::Notification { .. }));
    }

    #[test]
    fn test_serialize_omits_absent_fields() {
        let text = Message::notification("ping", None).serialize();
        assert!(!text.contains("params"), "{}", text);

        let text =
            Message::error_response(RequestId::from(1i64), ErrorObject::internal("x")).serialize();
        assert!(!text.contains("data"), "{}", text);
        assert!(text.contains(r#""jsonrpc":"2.0""#), "{}", text);
    }

    #[test]
    fn test_numeric_and_string_ids_share_key() {
        assert_eq!(RequestId::from(1i64).key(), RequestId::from("1").key());
        let parsed = Message::parse(r#"{"jsonrpc":"2.0","id":1,"result":true}"#).unwrap();
        assert_eq!(parsed.id().map(RequestId::key), Some("1".to_string()));
    }

    #[test]
    fn test_invalid_messages() {
        assert!(matches!(Message::parse("not json"), Err(RpcError::Protocol(_))));
        assert!(matches!(Message::parse("[1,2]"), Err(RpcError::Protocol(_))));
        assert!(matches!(
            Message::parse(r#"{"jsonrpc":"2.0","result":1}"#),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            Message::parse(r#"{"jsonrpc":"2.0","id":1}"#),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            Message::parse(r#"{"jsonrpc":"2.0","id":true,"method":"m"}"#),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_wide_and_fractional_ids_are_kept() {
        for raw in ["18446744073709551615", "2.5", "-3"] {
            let text = format!(r#"{{"jsonrpc":"2.0","id":{},"method":"echo"}}"#, raw);
            let parsed = Message::parse(&text).unwrap();
            let id = parsed.id().cloned().unwrap();
            assert_eq!(id.key(), raw);

            let reply = Message::response(id, Value::Null).serialize();
            assert!(reply.contains(&format!(r#""id":{}"#, raw)), "{}", reply);
        }
    }

    #[test]
    fn test_accessors() {
        let req = Message::request(RequestId::from(4i64), "hooks.invoke", None);
        assert_eq!(req.method(), Some("hooks.invoke"));
        assert_eq!(req.id(), Some(&RequestId::from(4i64)));
        assert_eq!(Message::notification("n", None).id(), None);
        assert_eq!(Message::response(RequestId::from(1i64), json!(1)).method(), None);
    }
}
