//! Universal event envelope - the typed unit carried by the event bus.
//!
//! Every significant occurrence in the daemon (plan lifecycle, action
//! execution, security verdicts, trigger fires) is emitted as a
//! [`UniversalEvent`]. Events are immutable once emitted; causal linkage is
//! established at creation time through [`UniversalEvent::spawn_child`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// Standard topics.
pub const TOPIC_PLANS: &str = "iml.plans";
pub const TOPIC_ACTIONS: &str = "iml.actions";
pub const TOPIC_SECURITY: &str = "iml.security";
pub const TOPIC_ERRORS: &str = "iml.errors";
pub const TOPIC_TRIGGERS: &str = "iml.triggers";

/// Advisory processing priority. Lower ordinal = more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// Structured envelope for all daemon events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub payload: Value,
    /// Parent event id. Every non-root event points at a previously emitted
    /// event in the same session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<String>,
    /// Child event ids, appended once per `spawn_child` call.
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl UniversalEvent {
    pub fn new(event_type: &str, topic: &str, source: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
            caused_by: None,
            causes: Vec::new(),
            session_id: None,
            correlation_id: None,
            priority: EventPriority::Normal,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Create a child event caused by this one.
    ///
    /// The child inherits session, correlation and priority; `caused_by` is
    /// set to this event's id and the child's id is appended to `causes`.
    pub fn spawn_child(
        &mut self,
        event_type: &str,
        topic: &str,
        source: &str,
        payload: Value,
    ) -> UniversalEvent {
        let child = UniversalEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
            caused_by: Some(self.id.clone()),
            causes: Vec::new(),
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            priority: self.priority,
            metadata: HashMap::new(),
        };
        self.causes.push(child.id.clone());
        child
    }
}
