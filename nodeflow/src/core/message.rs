//! The pipeline message: the unit of transport between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Open key/value payload interpreted by nodes against their contracts.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Domain identifiers a run concerns (patient, study, series, ...).
///
/// Carried through every hop, never interpreted by the engine.
pub type EntityRefs = BTreeMap<String, serde_json::Value>;

/// What happened at one step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// A trigger created the run.
    Triggered,
    /// The node ran and its successors were dispatched.
    Completed,
    /// The node ran and had no successor to dispatch.
    Terminal,
    /// The branch was handed to the task service at a checkpoint.
    Parked,
    /// A completion trigger resumed the run after a checkpoint.
    Resumed,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triggered => write!(f, "triggered"),
            Self::Completed => write!(f, "completed"),
            Self::Terminal => write!(f, "terminal"),
            Self::Parked => write!(f, "parked"),
            Self::Resumed => write!(f, "resumed"),
        }
    }
}

/// One entry of a message's step history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Node (or trigger) name.
    pub node: String,
    /// When the step was recorded.
    pub at: DateTime<Utc>,
    /// Step outcome.
    pub outcome: StepOutcome,
    /// Successor this copy was forked towards, for fan-out copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl StepRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(node: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            node: node.into(),
            at: Utc::now(),
            outcome,
            branch: None,
        }
    }

    /// Notes the fan-out branch this record belongs to.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// A message travelling through a pipeline run.
///
/// The correlation id is fixed at creation and has no mutator; the step
/// history can only be appended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMessage {
    message_id: Uuid,
    correlation_id: Uuid,
    #[serde(default)]
    entity_refs: EntityRefs,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    step_history: Vec<StepRecord>,
}

impl PipelineMessage {
    /// Starts a new run from a trigger.
    #[must_use]
    pub fn triggered(trigger: &str, entity_refs: EntityRefs, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            entity_refs,
            payload,
            step_history: vec![StepRecord::new(trigger, StepOutcome::Triggered)],
        }
    }

    /// Starts the continuation of a run parked at a checkpoint.
    ///
    /// `trigger` is the completion event name. Reuses the parked run's
    /// correlation id when the event carries it, otherwise starts a fresh one.
    /// The dispatcher appends the checkpoint's `Resumed` step when it
    /// forwards this message.
    #[must_use]
    pub fn resumed(
        trigger: &str,
        correlation_id: Option<Uuid>,
        entity_refs: EntityRefs,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            entity_refs,
            payload,
            step_history: vec![StepRecord::new(trigger, StepOutcome::Triggered)],
        }
    }

    /// Builds the message for the next hop.
    ///
    /// The new message gets a fresh id, keeps the correlation id and entity
    /// refs, takes `payload` as its whole payload and extends the history.
    #[must_use]
    pub fn forward(&self, payload: Payload, record: StepRecord) -> Self {
        let mut step_history = self.step_history.clone();
        step_history.push(record);
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            entity_refs: self.entity_refs.clone(),
            payload,
            step_history,
        }
    }

    /// Appends a step to the history.
    pub fn record(&mut self, record: StepRecord) {
        self.step_history.push(record);
    }

    /// Returns the message id.
    #[must_use]
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Returns the run's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Returns the entity refs.
    #[must_use]
    pub fn entity_refs(&self) -> &EntityRefs {
        &self.entity_refs
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the step history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[StepRecord] {
        &self.step_history
    }

    /// Returns the names of the steps recorded so far.
    #[must_use]
    pub fn visited(&self) -> Vec<&str> {
        self.step_history.iter().map(|r| r.node.as_str()).collect()
    }

    /// Serializes the message as a broker body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a broker body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn refs() -> EntityRefs {
        let mut refs = EntityRefs::new();
        refs.insert("patient_id".to_string(), json!(42));
        refs
    }

    fn payload(key: &str, value: serde_json::Value) -> Payload {
        let mut payload = Payload::new();
        payload.insert(key.to_string(), value);
        payload
    }

    #[test]
    fn test_triggered_starts_history() {
        let msg = PipelineMessage::triggered("patient_created", refs(), Payload::new());

        assert_eq!(msg.history().len(), 1);
        assert_eq!(msg.history()[0].outcome, StepOutcome::Triggered);
        assert_eq!(msg.visited(), vec!["patient_created"]);
    }

    #[test]
    fn test_forward_keeps_correlation_and_replaces_payload() {
        let first = PipelineMessage::triggered("patient_created", refs(), payload("a", json!(1)));
        let next = first.forward(
            payload("b", json!(2)),
            StepRecord::new("anonymize", StepOutcome::Completed),
        );

        assert_eq!(next.correlation_id(), first.correlation_id());
        assert_ne!(next.message_id(), first.message_id());
        assert_eq!(next.entity_refs(), first.entity_refs());
        assert_eq!(next.payload().get("a"), None);
        assert_eq!(next.payload().get("b"), Some(&json!(2)));
        assert_eq!(next.visited(), vec!["patient_created", "anonymize"]);
        // The source message is untouched.
        assert_eq!(first.history().len(), 1);
    }

    #[test]
    fn test_resumed_reuses_correlation_id() {
        let id = Uuid::new_v4();
        let msg = PipelineMessage::resumed("quality_check_finished", Some(id), refs(), Payload::new());
        assert_eq!(msg.correlation_id(), id);
        assert_eq!(msg.visited(), vec!["quality_check_finished"]);

        let fresh = PipelineMessage::resumed("quality_check_finished", None, refs(), Payload::new());
        assert_ne!(fresh.correlation_id(), id);
    }

    #[test]
    fn test_wire_format() {
        let msg = PipelineMessage::triggered("patient_created", refs(), payload("k", json!("v")));
        let bytes = msg.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["entity_refs"]["patient_id"], json!(42));
        assert_eq!(value["payload"]["k"], json!("v"));
        assert_eq!(value["step_history"][0]["outcome"], json!("triggered"));
        assert!(value["step_history"][0].get("branch").is_none());

        assert_eq!(PipelineMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(PipelineMessage::from_bytes(b"not json").is_err());
        assert!(PipelineMessage::from_bytes(br#"{"payload": {}}"#).is_err());
    }
}
