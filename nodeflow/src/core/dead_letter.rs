//! Dead-letter records for permanently failed messages.

use crate::errors::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal record of a message that could not be processed.
///
/// Written once per failed message and never mutated: fields are private
/// and only readable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    original_message: serde_json::Value,
    failing_node: String,
    error_kind: ErrorKind,
    error_detail: String,
    attempt_count: u32,
    first_failed_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

impl DeadLetterRecord {
    /// Creates a record for a delivery body.
    ///
    /// The body is kept as JSON when it parses, and as a lossy UTF-8 string
    /// otherwise, so malformed deliveries remain inspectable.
    #[must_use]
    pub fn new(
        body: &[u8],
        failing_node: impl Into<String>,
        error_kind: ErrorKind,
        error_detail: impl Into<String>,
        attempt_count: u32,
        first_failed_at: DateTime<Utc>,
    ) -> Self {
        let original_message = serde_json::from_slice::<serde_json::Value>(body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()));
        let correlation_id = original_message
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        Self {
            original_message,
            failing_node: failing_node.into(),
            error_kind,
            error_detail: error_detail.into(),
            attempt_count,
            first_failed_at,
            dead_lettered_at: Utc::now(),
            correlation_id,
        }
    }

    /// Returns the original message.
    #[must_use]
    pub fn original_message(&self) -> &serde_json::Value {
        &self.original_message
    }

    /// Returns the node that failed.
    #[must_use]
    pub fn failing_node(&self) -> &str {
        &self.failing_node
    }

    /// Returns the failure classification.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        self.error_kind
    }

    /// Returns the failure detail.
    #[must_use]
    pub fn error_detail(&self) -> &str {
        &self.error_detail
    }

    /// Returns how many attempts were made.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Returns when the first attempt failed.
    #[must_use]
    pub fn first_failed_at(&self) -> DateTime<Utc> {
        self.first_failed_at
    }

    /// Returns when the record was written.
    #[must_use]
    pub fn dead_lettered_at(&self) -> DateTime<Utc> {
        self.dead_lettered_at
    }

    /// Returns the correlation id of the failed message, if it had one.
    #[must_use]
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Serializes the record as a broker body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a broker body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
