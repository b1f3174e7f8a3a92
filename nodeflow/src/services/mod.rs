//! The persistence/task service the engine calls out to.
//!
//! Nodes use it to create domain records; the dispatcher uses it to open a
//! human task when a branch reaches a checkpoint. Only the interface is
//! specified here; the service itself lives outside the engine.

#[cfg(feature = "http")]
mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::HttpTaskService;
pub use memory::{InMemoryTaskService, MarkedTask, StoredRecord};

use crate::core::{EntityRefs, Payload};
use crate::errors::ServiceError;
use async_trait::async_trait;
use uuid::Uuid;

/// Interface to the persistence/task service.
///
/// Calls are made at least once per delivery attempt, so implementations
/// should tolerate repeats for the same correlation id. Task creation
/// carries an idempotency key for that purpose.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Creates a domain record and returns its id.
    async fn create_record(
        &self,
        record_type: &str,
        entity_refs: &EntityRefs,
        fields: &Payload,
    ) -> Result<String, ServiceError>;

    /// Opens a human task for a parked branch and returns the task id.
    ///
    /// A repeated call with an `idempotency_key` already seen must return
    /// the id of the existing task instead of opening another one.
    async fn mark_task(
        &self,
        task_type: &str,
        correlation_id: Uuid,
        entity_refs: &EntityRefs,
        idempotency_key: &str,
    ) -> Result<String, ServiceError>;
}
