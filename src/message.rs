use std::collections::HashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The envelope handed to a workflow instance and carried between nodes.
/// Serialized with the same camelCase conventions as the workflow DSL.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize)]
pub struct Message {
    id: String,

    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,

    payload: Value,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(id: &str, payload: Value, session_id: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            session_id,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Build a message with a generated id.
    pub fn of(payload: Value) -> Self {
        Self::new(&uuid::Uuid::new_v4().to_string(), payload, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn payload(&self) -> Value {
        self.payload.clone()
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.metadata.remove(name);
    }
}
