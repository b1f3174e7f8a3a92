//! Built-in handlers available to graph definition files.

use super::{NodeContext, NodeHandler};
use crate::core::{NodeOutput, Payload};
use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, String> {
    let params = if params.is_null() {
        serde_json::Value::Object(Payload::new())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| e.to_string())
}

/// Forwards its input payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl NodeHandler for Passthrough {
    async fn handle(&self, _ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        Ok(NodeOutput::Replace(payload))
    }
}

/// Merges static fields into the payload.
///
/// Params: `fields` (table). Existing keys are overwritten.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetFields {
    #[serde(default)]
    fields: Payload,
}

impl SetFields {
    /// Creates the handler from its fields.
    #[must_use]
    pub fn new(fields: Payload) -> Self {
        Self { fields }
    }

    pub(crate) fn from_params(params: &serde_json::Value) -> Result<Self, String> {
        parse_params(params)
    }
}

#[async_trait]
impl NodeHandler for SetFields {
    async fn handle(&self, _ctx: &NodeContext, mut payload: Payload) -> Result<NodeOutput, HandlerError> {
        for (key, value) in &self.fields {
            payload.insert(key.clone(), value.clone());
        }
        Ok(NodeOutput::Replace(payload))
    }
}

fn default_id_field() -> String {
    "record_id".to_string()
}

/// Stores the payload as a domain record through the task service.
///
/// Params: `record_type` (required), `id_field` (default `record_id`). The
/// output is the input payload plus the created record's id.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecord {
    record_type: String,
    #[serde(default = "default_id_field")]
    id_field: String,
}

impl CreateRecord {
    /// Creates the handler for a record type.
    #[must_use]
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id_field: default_id_field(),
        }
    }

    pub(crate) fn from_params(params: &serde_json::Value) -> Result<Self, String> {
        parse_params(params)
    }
}

#[async_trait]
impl NodeHandler for CreateRecord {
    async fn handle(&self, ctx: &NodeContext, mut payload: Payload) -> Result<NodeOutput, HandlerError> {
        let id = ctx
            .services()
            .create_record(&self.record_type, ctx.entity_refs(), &payload)
            .await?;
        payload.insert(self.id_field.clone(), serde_json::Value::String(id));
        Ok(NodeOutput::Replace(payload))
    }
}

fn default_output_field() -> String {
    "result".to_string()
}

/// Compares two payload fields for equality.
///
/// Params: `left`, `right` (required), `output` (default `result`). The
/// output is the input payload plus a boolean under `output`. A missing
/// field is a domain error.
#[derive(Debug, Clone, Deserialize)]
pub struct CompareFields {
    left: String,
    right: String,
    #[serde(default = "default_output_field")]
    output: String,
}

impl CompareFields {
    /// Creates the handler.
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            output: default_output_field(),
        }
    }

    pub(crate) fn from_params(params: &serde_json::Value) -> Result<Self, String> {
        parse_params(params)
    }
}

#[async_trait]
impl NodeHandler for CompareFields {
    async fn handle(&self, _ctx: &NodeContext, mut payload: Payload) -> Result<NodeOutput, HandlerError> {
        let left = payload
            .get(&self.left)
            .ok_or_else(|| HandlerError::new(format!("missing field '{}'", self.left)))?;
        let right = payload
            .get(&self.right)
            .ok_or_else(|| HandlerError::new(format!("missing field '{}'", self.right)))?;
        let equal = left == right;
        payload.insert(self.output.clone(), serde_json::Value::Bool(equal));
        Ok(NodeOutput::Replace(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::test_context;
    use crate::services::InMemoryTaskService;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    #[tokio::test]
    async fn test_passthrough() {
        let input = payload(json!({"a": 1}));
        let output = Passthrough.handle(&test_context("p"), input.clone()).await.unwrap();
        assert_eq!(output, NodeOutput::Replace(input));
    }

    #[tokio::test]
    async fn test_set_fields_overwrites() {
        let handler = SetFields::from_params(&json!({"fields": {"status": "anonymized"}})).unwrap();
        let output = handler
            .handle(&test_context("s"), payload(json!({"status": "raw", "id": 1})))
            .await
            .unwrap();
        assert_eq!(
            output,
            NodeOutput::Replace(payload(json!({"status": "anonymized", "id": 1})))
        );
    }

    #[tokio::test]
    async fn test_create_record_writes_id() {
        let service = Arc::new(InMemoryTaskService::new());
        let ctx = NodeContext::new(
            "get_birads",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Default::default(),
            service.clone(),
        );

        let output = CreateRecord::new("birads_result")
            .handle(&ctx, payload(json!({"birads": 2})))
            .await
            .unwrap();

        let records = service.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, "birads_result");
        match output {
            NodeOutput::Replace(p) => assert_eq!(p.get("record_id"), Some(&json!(records[0].id))),
            NodeOutput::Unchanged => panic!("expected output"),
        }
    }

    #[tokio::test]
    async fn test_create_record_unavailable_is_transient() {
        let service = Arc::new(InMemoryTaskService::new());
        service.fail_next(1);
        let ctx = NodeContext::new("n", Uuid::new_v4(), Uuid::new_v4(), Default::default(), service);

        let err = CreateRecord::new("r").handle(&ctx, Payload::new()).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn test_compare_fields() {
        let handler = CompareFields::new("ai_mask", "doctor_mask");

        let same = handler
            .handle(&test_context("c"), payload(json!({"ai_mask": [1, 2], "doctor_mask": [1, 2]})))
            .await
            .unwrap();
        assert!(matches!(same, NodeOutput::Replace(ref p) if p.get("result") == Some(&json!(true))));

        let different = handler
            .handle(&test_context("c"), payload(json!({"ai_mask": [1], "doctor_mask": [2]})))
            .await
            .unwrap();
        assert!(matches!(different, NodeOutput::Replace(ref p) if p.get("result") == Some(&json!(false))));
    }

    #[tokio::test]
    async fn test_compare_fields_missing_is_permanent() {
        let err = CompareFields::new("a", "b")
            .handle(&test_context("c"), payload(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(!err.transient);
        assert!(err.message.contains("'b'"));
    }
}
