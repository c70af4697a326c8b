//! Immutable input events.
//!
//! An event is the single input consumed by one orchestration invocation.
//! It is assembled by the caller with the `with_*` builders and is read-only
//! once handed to the runner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata key carrying the caller's session identifier
pub const SESSION_ID_KEY: &str = "session_id";

/// Event data key used by the built-in agents for the user message
pub const MESSAGE_KEY: &str = "message";

/// An input unit carrying a data payload and string metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,

    timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_agent: Option<String>,

    #[serde(default)]
    data: Map<String, Value>,

    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl Event {
    /// Create an event with a fresh identifier and the given payload
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            target_agent: None,
            source_agent: None,
            data,
            metadata: BTreeMap::new(),
        }
    }

    /// Create an event whose payload is a single `message` entry
    pub fn from_message(message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert(MESSAGE_KEY.to_string(), Value::String(message.into()));
        Self::new(data)
    }

    /// Use a caller-supplied identifier instead of a generated one
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Add a payload entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the caller's session identifier
    pub fn with_session_id(self, session_id: impl Into<String>) -> Self {
        self.with_metadata(SESSION_ID_KEY, session_id)
    }

    pub fn with_target_agent(mut self, agent: impl Into<String>) -> Self {
        self.target_agent = Some(agent.into());
        self
    }

    pub fn with_source_agent(mut self, agent: impl Into<String>) -> Self {
        self.source_agent = Some(agent.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn target_agent(&self) -> Option<&str> {
        self.target_agent.as_deref()
    }

    pub fn source_agent(&self) -> Option<&str> {
        self.source_agent.as_deref()
    }

    /// The full payload
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// A single payload value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The `message` payload entry, if it is a string
    pub fn message(&self) -> Option<&str> {
        self.data.get(MESSAGE_KEY).and_then(Value::as_str)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata_value(SESSION_ID_KEY)
    }
}
