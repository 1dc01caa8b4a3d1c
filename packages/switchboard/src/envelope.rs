//! The `{type, data}` wire unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// The only unit exchanged over the connection.
///
/// `type` picks the dispatch route; `data` is opaque to the engine. A frame
/// without `data` decodes with `data: null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// Parse one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: Self = serde_json::from_str(text)?;
        if envelope.event_type.is_empty() {
            return Err(DecodeError::EmptyType);
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
