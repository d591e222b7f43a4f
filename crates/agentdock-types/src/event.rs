use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle notification published on the engine event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
    pub emitted_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            emitted_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.properties.get("agentId").and_then(|v| v.as_str())
    }
}
