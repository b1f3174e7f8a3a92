//! Contracts backed by serde types.
//!
//! A payload satisfies a [`TypedContract<T>`] when it deserializes into `T`.
//! Handlers can use [`TypedContract::decode`] and [`TypedContract::encode`]
//! to move between the open payload map and their own structs.

use super::{PayloadContract, ValidationIssue};
use crate::core::Payload;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Contract that accepts payloads deserializable into `T`.
pub struct TypedContract<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedContract<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a contract named after the type.
    #[must_use]
    pub fn new() -> Self {
        let full = std::any::type_name::<T>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Self::named(short)
    }

    /// Creates a contract with an explicit name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// Deserializes a payload into `T`.
    pub fn decode(&self, payload: &Payload) -> Result<T, ValidationIssue> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| ValidationIssue::new(format!("Deserialization error: {e}")))
    }

    /// Serializes `T` into a payload map.
    pub fn encode(&self, value: &T) -> Result<Payload, ValidationIssue> {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(ValidationIssue::new("Payload must serialize to an object")),
            Err(e) => Err(ValidationIssue::new(format!("Serialization error: {e}"))),
        }
    }
}

impl<T> Default for TypedContract<T>
where
    T: Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypedContract<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedContract")
            .field("name", &self.name)
            .finish()
    }
}

impl<T> PayloadContract for TypedContract<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, payload: &Payload) -> Vec<ValidationIssue> {
        match self.decode(payload) {
            Ok(_) => Vec::new(),
            Err(issue) => vec![issue],
        }
    }
}
