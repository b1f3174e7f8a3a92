//! In-process task service.

use super::TaskService;
use crate::core::{EntityRefs, Payload};
use crate::errors::ServiceError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// A record created through [`TaskService::create_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Assigned id.
    pub id: String,
    /// Record type.
    pub record_type: String,
    /// Entity refs of the run that created it.
    pub entity_refs: EntityRefs,
    /// Record fields.
    pub fields: Payload,
}

/// A task opened through [`TaskService::mark_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedTask {
    /// Assigned id.
    pub id: String,
    /// Task type.
    pub task_type: String,
    /// Correlation id of the parked run.
    pub correlation_id: Uuid,
    /// Entity refs of the parked run.
    pub entity_refs: EntityRefs,
    /// Key deduplicating repeated requests for the same parked branch.
    pub idempotency_key: String,
}

/// Task service keeping records and tasks in memory.
///
/// Used by tests and by `run-workers` when no service URL is configured.
/// [`InMemoryTaskService::fail_next`] injects `Unavailable` errors to
/// exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryTaskService {
    records: RwLock<Vec<StoredRecord>>,
    tasks: RwLock<Vec<MarkedTask>>,
    failures: AtomicUsize,
}

impl InMemoryTaskService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with [`ServiceError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Returns all created records.
    #[must_use]
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.read().clone()
    }

    /// Returns all opened tasks.
    #[must_use]
    pub fn tasks(&self) -> Vec<MarkedTask> {
        self.tasks.read().clone()
    }

    /// Returns the tasks of one type.
    #[must_use]
    pub fn tasks_of_type(&self, task_type: &str) -> Vec<MarkedTask> {
        self.tasks
            .read()
            .iter()
            .filter(|t| t.task_type == task_type)
            .cloned()
            .collect()
    }

    fn take_failure(&self) -> Result<(), ServiceError> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(ServiceError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TaskService for InMemoryTaskService {
    async fn create_record(
        &self,
        record_type: &str,
        entity_refs: &EntityRefs,
        fields: &Payload,
    ) -> Result<String, ServiceError> {
        self.take_failure()?;
        let id = Uuid::new_v4().to_string();
        self.records.write().push(StoredRecord {
            id: id.clone(),
            record_type: record_type.to_string(),
            entity_refs: entity_refs.clone(),
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn mark_task(
        &self,
        task_type: &str,
        correlation_id: Uuid,
        entity_refs: &EntityRefs,
        idempotency_key: &str,
    ) -> Result<String, ServiceError> {
        self.take_failure()?;
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.iter().find(|t| t.idempotency_key == idempotency_key) {
            return Ok(existing.id.clone());
        }
        let id = Uuid::new_v4().to_string();
        tasks.push(MarkedTask {
            id: id.clone(),
            task_type: task_type.to_string(),
            correlation_id,
            entity_refs: entity_refs.clone(),
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_record_stores_fields() {
        let service = InMemoryTaskService::new();
        let mut fields = Payload::new();
        fields.insert("birads".to_string(), json!(3));

        let id = service
            .create_record("birads_result", &EntityRefs::new(), &fields)
            .await
            .unwrap();

        let records = service.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].fields.get("birads"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_mark_task_filters_by_type() {
        let service = InMemoryTaskService::new();
        let correlation_id = Uuid::new_v4();

        service
            .mark_task("quality_check", correlation_id, &EntityRefs::new(), "k1")
            .await
            .unwrap();
        service
            .mark_task("check_differences", correlation_id, &EntityRefs::new(), "k2")
            .await
            .unwrap();

        let tasks = service.tasks_of_type("quality_check");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let service = InMemoryTaskService::new();
        service.fail_next(1);

        let first = service
            .mark_task("quality_check", Uuid::new_v4(), &EntityRefs::new(), "k1")
            .await;
        assert!(matches!(first, Err(ServiceError::Unavailable(_))));

        let second = service
            .mark_task("quality_check", Uuid::new_v4(), &EntityRefs::new(), "k1")
            .await;
        assert!(second.is_ok());
        assert_eq!(service.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_key_returns_existing_task() {
        let service = InMemoryTaskService::new();
        let correlation_id = Uuid::new_v4();

        let first = service
            .mark_task("quality_check", correlation_id, &EntityRefs::new(), "run:qc:m1")
            .await
            .unwrap();
        let again = service
            .mark_task("quality_check", correlation_id, &EntityRefs::new(), "run:qc:m1")
            .await
            .unwrap();
        let other = service
            .mark_task("quality_check", correlation_id, &EntityRefs::new(), "run:qc:m2")
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(service.tasks().len(), 2);
    }
}
