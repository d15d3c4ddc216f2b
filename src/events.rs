//! Session event envelope.
//!
//! The router only needs an event's discriminant (`type`) to match typed
//! subscribers; the payload stays an opaque JSON value for the caller's own
//! event model. A custom [`EventParser`] can be supplied to validate or
//! reshape events before fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, RpcResult};

/// Well-known event types.
pub mod event_types {
    pub const SESSION_IDLE: &str = "session.idle";
    pub const SESSION_ERROR: &str = "session.error";
    pub const ASSISTANT_MESSAGE: &str = "assistant.message";
    pub const ASSISTANT_MESSAGE_DELTA: &str = "assistant.message_delta";
    pub const TOOL_EXECUTION_START: &str = "tool.execution_start";
    pub const TOOL_EXECUTION_COMPLETE: &str = "tool.execution_complete";
}

/// One event delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl SessionEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            timestamp: None,
            parent_id: None,
            ephemeral: None,
            event_type: event_type.into(),
            data,
        }
    }

    /// Default parser: structural decode of the event envelope.
    pub fn from_value(value: Value) -> RpcResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("Invalid session event: {}", e)))
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

/// Turns the raw `event` payload of a `session.event` notification into a
/// [`SessionEvent`].
pub type EventParser = Arc<dyn Fn(Value) -> RpcResult<SessionEvent> + Send + Sync>;

pub fn default_event_parser() -> EventParser {
    Arc::new(SessionEvent::from_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_event() {
        let event = SessionEvent::from_value(json!({
            "id": "e1",
            "timestamp": "2025-01-02T03:04:05Z",
            "parentId": null,
            "type": "assistant.message",
            "data": {"content": "hi"}
        }))
        .unwrap();

        assert_eq!(event.event_type(), event_types::ASSISTANT_MESSAGE);
        assert_eq!(event.id.as_deref(), Some("e1"));
        assert!(event.timestamp.is_some());
        assert_eq!(event.data["content"], "hi");
    }

    #[test]
    fn test_parse_minimal_event() {
        let event = SessionEvent::from_value(json!({"type": "session.idle"})).unwrap();
        assert_eq!(event, SessionEvent::new("session.idle", Value::Null));
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let err = SessionEvent::from_value(json!({"data": {}})).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_default_parser() {
        let parser = default_event_parser();
        let event = parser(json!({"type": "session.error", "data": {"message": "x"}})).unwrap();
        assert_eq!(event.event_type(), event_types::SESSION_ERROR);
    }
}
