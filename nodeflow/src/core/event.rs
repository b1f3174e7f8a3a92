//! Lifecycle events consumed from the events queue.

use super::{EntityRefs, Payload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A notification that may fire a trigger.
///
/// Entity events fire event triggers; `task_finished` fires the completion
/// trigger of the checkpoint bound to its task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A domain entity was created.
    EntityCreated {
        /// Entity type, e.g. `patient`.
        entity: String,
        /// Identifiers of the new entity.
        #[serde(default)]
        entity_refs: EntityRefs,
        /// Initial payload for the run.
        #[serde(default)]
        payload: Payload,
    },
    /// A domain entity changed status.
    StatusChanged {
        /// Entity type, e.g. `study`.
        entity: String,
        /// The new status.
        status: String,
        /// Identifiers of the entity.
        #[serde(default)]
        entity_refs: EntityRefs,
        /// Initial payload for the run.
        #[serde(default)]
        payload: Payload,
    },
    /// The task service finished a human task.
    TaskFinished {
        /// Task type, matching a checkpoint's task type.
        task_type: String,
        /// Identifiers the task concerned.
        #[serde(default)]
        entity_refs: EntityRefs,
        /// Correlation id of the parked run, when the service echoes it.
        #[serde(default)]
        correlation_id: Option<Uuid>,
        /// Task results, used as the payload of the resumed run.
        #[serde(default)]
        payload: Payload,
    },
    /// Any other named event.
    Custom {
        /// Event name.
        name: String,
        /// Optional status.
        #[serde(default)]
        status: Option<String>,
        /// Identifiers the event concerns.
        #[serde(default)]
        entity_refs: EntityRefs,
        /// Initial payload for the run.
        #[serde(default)]
        payload: Payload,
    },
}

impl LifecycleEvent {
    /// Returns the name event triggers are declared against.
    ///
    /// `entity_created` on a `patient` is `patient_created`; a status change on
    /// a `study` is `study_status_changed`.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::EntityCreated { entity, .. } => format!("{entity}_created"),
            Self::StatusChanged { entity, .. } => format!("{entity}_status_changed"),
            Self::TaskFinished { task_type, .. } => format!("{task_type}_finished"),
            Self::Custom { name, .. } => name.clone(),
        }
    }

    /// Returns the status carried by the event, if any.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::StatusChanged { status, .. } => Some(status),
            Self::Custom { status, .. } => status.as_deref(),
            _ => None,
        }
    }

    /// Returns the entity refs.
    #[must_use]
    pub fn entity_refs(&self) -> &EntityRefs {
        match self {
            Self::EntityCreated { entity_refs, .. }
            | Self::StatusChanged { entity_refs, .. }
            | Self::TaskFinished { entity_refs, .. }
            | Self::Custom { entity_refs, .. } => entity_refs,
        }
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        match self {
            Self::EntityCreated { payload, .. }
            | Self::StatusChanged { payload, .. }
            | Self::TaskFinished { payload, .. }
            | Self::Custom { payload, .. } => payload,
        }
    }

    /// Creates an `entity_created` event.
    #[must_use]
    pub fn entity_created(entity: impl Into<String>, entity_refs: EntityRefs) -> Self {
        Self::EntityCreated {
            entity: entity.into(),
            entity_refs,
            payload: Payload::new(),
        }
    }

    /// Creates a `task_finished` event.
    #[must_use]
    pub fn task_finished(
        task_type: impl Into<String>,
        entity_refs: EntityRefs,
        correlation_id: Option<Uuid>,
    ) -> Self {
        Self::TaskFinished {
            task_type: task_type.into(),
            entity_refs,
            correlation_id,
            payload: Payload::new(),
        }
    }

    /// Serializes the event as a broker body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a broker body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
