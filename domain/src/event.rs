//! Backend agent events.
//!
//! [`AgentEvent`] is the unit that flows from a backend agent instance to
//! the streaming layer: a tagged record with a type string and a free-form
//! property bag. Events are immutable once produced; consumers read them,
//! never rewrite them.
//!
//! Well-known type strings live in [`event_types`]. The set is open: an
//! agent may emit types this crate has never heard of, and they still flow
//! through buffering and dispatch untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Well-known event type strings emitted by backend agents.
pub mod event_types {
    /// Incremental assistant answer text.
    pub const ASSISTANT_DELTA: &str = "assistant.message.delta";
    /// Complete assistant answer text.
    pub const ASSISTANT_MESSAGE: &str = "assistant.message";
    /// Assistant reasoning trace (not part of the answer).
    pub const ASSISTANT_REASONING: &str = "assistant.reasoning";
    /// The agent started a repository search/read operation.
    pub const TOOL_START: &str = "tool.execution_start";
    /// The repository operation finished.
    pub const TOOL_COMPLETE: &str = "tool.execution_complete";
    /// Token accounting for the turn.
    pub const SESSION_USAGE: &str = "session.usage_info";
    /// The session finished its turn and is idle (terminal).
    pub const SESSION_IDLE: &str = "session.idle";
    /// The session failed (terminal).
    pub const SESSION_ERROR: &str = "session.error";
}

/// A single event reported by a backend agent.
///
/// Properties may carry a `sessionId` identifying the originating session
/// and, for error events, an `error` descriptor (either a plain string or
/// an object with a `message` field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Event type tag, e.g. `assistant.message.delta`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Everything else the agent attached to the event.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl AgentEvent {
    /// Create an event with an empty property bag.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            properties: Map::new(),
        }
    }

    /// Attach a property, builder style.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// An assistant text delta for `session_id`.
    pub fn delta(session_id: &str, text: &str) -> Self {
        Self::new(event_types::ASSISTANT_DELTA)
            .with_property("sessionId", json!(session_id))
            .with_property("content", json!(text))
    }

    /// A complete assistant message for `session_id`.
    pub fn message(session_id: &str, text: &str) -> Self {
        Self::new(event_types::ASSISTANT_MESSAGE)
            .with_property("sessionId", json!(session_id))
            .with_property("content", json!(text))
    }

    /// The terminal idle marker for `session_id`.
    pub fn idle(session_id: &str) -> Self {
        Self::new(event_types::SESSION_IDLE).with_property("sessionId", json!(session_id))
    }

    /// A terminal error for `session_id`.
    pub fn error(session_id: &str, message: &str) -> Self {
        Self::new(event_types::SESSION_ERROR)
            .with_property("sessionId", json!(session_id))
            .with_property("error", json!({ "message": message }))
    }

    /// Look up a raw property value.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// The session this event belongs to, if the agent attached one.
    pub fn session_id(&self) -> Option<&str> {
        self.properties.get("sessionId").and_then(Value::as_str)
    }

    /// Assistant text carried by delta/message events.
    pub fn content(&self) -> Option<&str> {
        self.properties.get("content").and_then(Value::as_str)
    }

    /// Human-readable error text for `session.error` events.
    ///
    /// Accepts both a bare string `error` property and the structured
    /// `{"error": {"message": ...}}` form; falls back to a top-level
    /// `message` property.
    pub fn error_message(&self) -> Option<&str> {
        match self.properties.get("error") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str),
            _ => self.properties.get("message").and_then(Value::as_str),
        }
    }

    /// Returns true if this event ends its session's stream.
    pub fn is_terminal(&self) -> bool {
        self.event_type == event_types::SESSION_IDLE
            || self.event_type == event_types::SESSION_ERROR
    }

    /// Returns true if this is a `session.error` event.
    pub fn is_error(&self) -> bool {
        self.event_type == event_types::SESSION_ERROR
    }
}

impl std::fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.session_id() {
            Some(id) => write!(f, "{} ({id})", self.event_type),
            None => write!(f, "{}", self.event_type),
        }
    }
}
