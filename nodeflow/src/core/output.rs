//! Node output type.

use super::Payload;
use serde::{Deserialize, Serialize};

/// The value returned by a node handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum NodeOutput {
    /// The new payload. Replaces the incoming payload entirely.
    Replace(Payload),
    /// No output: the payload passes through unchanged.
    ///
    /// Only valid on nodes without an output contract or without
    /// successors.
    Unchanged,
}

impl NodeOutput {
    /// Creates an output replacing the payload.
    #[must_use]
    pub fn replace(payload: Payload) -> Self {
        Self::Replace(payload)
    }

    /// Creates an output with a single field.
    #[must_use]
    pub fn field(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut payload = Payload::new();
        payload.insert(key.into(), value);
        Self::Replace(payload)
    }

    /// Creates an output from a JSON value.
    ///
    /// Objects become the new payload; `null` means no output; any other
    /// value is rejected because payloads are maps.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => Ok(Self::Replace(map)),
            serde_json::Value::Null => Ok(Self::Unchanged),
            other => Err(other),
        }
    }

    /// Returns true if the handler produced no output.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// Resolves the payload the next hop carries.
    #[must_use]
    pub fn into_payload(self, incoming: &Payload) -> Payload {
        match self {
            Self::Replace(payload) => payload,
            Self::Unchanged => incoming.clone(),
        }
    }
}
