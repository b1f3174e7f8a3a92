//! Handler registry used to resolve handler names in graph definitions.

use super::builtin::{CompareFields, CreateRecord, Passthrough, SetFields};
use super::NodeHandler;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Builds a handler from the `params` table of a node definition.
pub type HandlerFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn NodeHandler>, String> + Send + Sync>;

/// Error raised when resolving a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No handler is registered under the name.
    #[error("Unknown handler '{0}'")]
    UnknownHandler(String),

    /// The factory rejected the params.
    #[error("Invalid params for handler '{handler}': {reason}")]
    InvalidParams {
        /// The handler name.
        handler: String,
        /// Why the params were rejected.
        reason: String,
    },
}

/// Maps handler names to factories.
///
/// Passed explicitly to the definition loader; there is no global registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in handlers registered.
    ///
    /// `passthrough`, `set_fields`, `create_record` and `compare_fields`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("passthrough", |_| Ok(Arc::new(Passthrough) as Arc<dyn NodeHandler>));
        registry.register("set_fields", |params| {
            Ok(Arc::new(SetFields::from_params(params)?) as Arc<dyn NodeHandler>)
        });
        registry.register("create_record", |params| {
            Ok(Arc::new(CreateRecord::from_params(params)?) as Arc<dyn NodeHandler>)
        });
        registry.register("compare_fields", |params| {
            Ok(Arc::new(CompareFields::from_params(params)?) as Arc<dyn NodeHandler>)
        });
        registry
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn NodeHandler>, String> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Registers a ready-made handler that takes no params.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.register(name, move |_| Ok(Arc::clone(&handler)));
    }

    /// Registers a handler and returns the registry.
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.register_handler(name, handler);
        self
    }

    /// Returns true if a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the handler registered under `name`.
    pub fn resolve(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn NodeHandler>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownHandler(name.to_string()))?;
        factory(params).map_err(|reason| RegistryError::InvalidParams {
            handler: name.to_string(),
            reason,
        })
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins();
        for name in ["passthrough", "set_fields", "create_record", "compare_fields"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("segment", &json!(null)).unwrap_err();
        assert_eq!(err, RegistryError::UnknownHandler("segment".to_string()));
    }

    #[test]
    fn test_invalid_params_reported() {
        let registry = HandlerRegistry::with_builtins();
        let err = registry.resolve("compare_fields", &json!({"left": "a"})).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParams { ref handler, .. } if handler == "compare_fields"));
    }

    #[test]
    fn test_register_handler_ignores_params() {
        let registry = HandlerRegistry::new().with_handler("noop", Arc::new(Passthrough));
        assert!(registry.resolve("noop", &json!({"anything": 1})).is_ok());
    }
}
