//! Outbound events delivered to the subscriber of an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::state::NodeName;

/// Event types sent over the control/event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    NodeStarted,
    NodeCompleted,
    NodeError,
    TokenStream,
    HitlPaused,
    HitlInterrupted,
    HitlResumed,
    HitlCancelled,
    ExecutionCompleted,
    ExecutionError,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::ExecutionStarted => "execution_started",
            EventType::NodeStarted => "node_started",
            EventType::NodeCompleted => "node_completed",
            EventType::NodeError => "node_error",
            EventType::TokenStream => "token_stream",
            EventType::HitlPaused => "hitl_paused",
            EventType::HitlInterrupted => "hitl_interrupted",
            EventType::HitlResumed => "hitl_resumed",
            EventType::HitlCancelled => "hitl_cancelled",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionError => "execution_error",
        };
        write!(f, "{}", s)
    }
}

/// A lifecycle or token event. Built once, never mutated after delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Node duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_complete: Option<bool>,
}

impl Event {
    pub fn new(event_type: EventType, execution_id: impl Into<String>) -> Self {
        Self {
            event_type,
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            node_id: None,
            duration: None,
            error: None,
            data: None,
            token: None,
            stream_complete: None,
        }
    }

    /// A `token_stream` event.
    pub fn token(execution_id: impl Into<String>, token: impl Into<String>, node: NodeName, is_last: bool) -> Self {
        Self {
            token: Some(token.into()),
            stream_complete: Some(is_last),
            ..Self::new(EventType::TokenStream, execution_id).with_node(node)
        }
    }

    pub fn with_node(mut self, node: NodeName) -> Self {
        self.node_id = Some(node.to_string());
        self
    }

    pub fn with_duration(mut self, millis: u64) -> Self {
        self.duration = Some(millis);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display_matches_wire_name() {
        let json = serde_json::to_value(EventType::HitlInterrupted).unwrap();
        assert_eq!(json, serde_json::json!("hitl_interrupted"));
        assert_eq!(EventType::HitlInterrupted.to_string(), "hitl_interrupted");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let event = Event::new(EventType::NodeStarted, "exec-1").with_node(NodeName::Route);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_started");
        assert_eq!(json["execution_id"], "exec-1");
        assert_eq!(json["node_id"], "route");
        assert!(json.get("error").is_none());
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_token_event_shape() {
        let event = Event::token("exec-1", "Hel", NodeName::Synthesize, false);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token_stream");
        assert_eq!(json["token"], "Hel");
        assert_eq!(json["stream_complete"], false);
        assert_eq!(json["node_id"], "synthesize");
    }
}
