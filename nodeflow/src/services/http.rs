//! HTTP client for a remote task service.

use super::TaskService;
use crate::core::{EntityRefs, Payload};
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Serialize)]
struct CreateRecordRequest<'a> {
    record_type: &'a str,
    entity_refs: &'a EntityRefs,
    fields: &'a Payload,
}

#[derive(Serialize)]
struct MarkTaskRequest<'a> {
    task_type: &'a str,
    correlation_id: Uuid,
    entity_refs: &'a EntityRefs,
    idempotency_key: &'a str,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: serde_json::Value,
}

/// Task service reached over HTTP.
///
/// Posts JSON to `{base}/records` and `{base}/tasks` and reads the created
/// id from the `id` field of the response. Task requests carry an
/// `idempotency_key`; the service answers a repeated key with the id of the
/// task it already opened. Connection failures and 5xx
/// responses are [`ServiceError::Unavailable`]; other error statuses are
/// [`ServiceError::Rejected`].
#[derive(Debug, Clone)]
pub struct HttpTaskService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskService {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<String, ServiceError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::Unavailable(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Rejected(format!("{url} returned {status}: {text}")));
        }

        let created: CreatedResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Rejected(format!("invalid response from {url}: {e}")))?;
        Ok(match created.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn create_record(
        &self,
        record_type: &str,
        entity_refs: &EntityRefs,
        fields: &Payload,
    ) -> Result<String, ServiceError> {
        self.post(
            "records",
            &CreateRecordRequest {
                record_type,
                entity_refs,
                fields,
            },
        )
        .await
    }

    async fn mark_task(
        &self,
        task_type: &str,
        correlation_id: Uuid,
        entity_refs: &EntityRefs,
        idempotency_key: &str,
    ) -> Result<String, ServiceError> {
        self.post(
            "tasks",
            &MarkTaskRequest {
                task_type,
                correlation_id,
                entity_refs,
                idempotency_key,
            },
        )
        .await
    }
}
