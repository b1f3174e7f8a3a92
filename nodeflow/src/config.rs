//! Worker settings.
//!
//! Settings come from a TOML file with a `[default]` table and optional
//! `[profiles.<name>]` tables merged over it, followed by `NODEFLOW_*`
//! environment overrides:
//!
//! ```toml
//! [default]
//! broker_url = "amqp://rabbit:5672/%2f"
//! default_concurrency = 4
//!
//! [default.retry]
//! max_attempts = 5
//!
//! [profiles.gpu]
//! capabilities = ["gpu"]
//! concurrency = { make_seg_from_ai = 1 }
//! ```

use crate::middleware::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`Settings::broker_url`].
pub const ENV_BROKER_URL: &str = "NODEFLOW_BROKER_URL";
/// Environment variable overriding [`Settings::capabilities`] (comma separated).
pub const ENV_CAPABILITIES: &str = "NODEFLOW_CAPABILITIES";
/// Environment variable overriding [`Settings::default_concurrency`].
pub const ENV_DEFAULT_CONCURRENCY: &str = "NODEFLOW_DEFAULT_CONCURRENCY";
/// Environment variable overriding [`Settings::task_service_url`].
pub const ENV_TASK_SERVICE_URL: &str = "NODEFLOW_TASK_SERVICE_URL";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("Cannot read settings '{}': {source}", path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML or has unknown keys.
    #[error("Invalid settings: {0}")]
    Parse(String),

    /// The requested profile is not declared.
    #[error("Unknown settings profile '{0}'")]
    UnknownProfile(String),

    /// An environment override could not be parsed.
    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn default_broker_url() -> String {
    "memory://".to_string()
}

fn default_queue_prefix() -> String {
    "nodeflow".to_string()
}

fn default_dead_letter_queue() -> String {
    "nodeflow.dead_letter".to_string()
}

fn default_events_queue() -> String {
    "nodeflow.events".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// Settings of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Broker URL (`memory://`, `amqp://...`).
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Prefix of node queue names.
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Queue receiving dead-letter records.
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,

    /// Queue carrying lifecycle events.
    #[serde(default = "default_events_queue")]
    pub events_queue: String,

    /// Concurrent deliveries per node unless overridden.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Per-node concurrency overrides. They win over the value declared on
    /// the node in the graph.
    #[serde(default)]
    pub concurrency: HashMap<String, usize>,

    /// Capabilities this process offers (e.g. `gpu`).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Handler timeout for nodes without their own.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Base URL of the HTTP task service.
    #[serde(default)]
    pub task_service_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            queue_prefix: default_queue_prefix(),
            dead_letter_queue: default_dead_letter_queue(),
            events_queue: default_events_queue(),
            default_concurrency: default_concurrency(),
            concurrency: HashMap::new(),
            capabilities: BTreeSet::new(),
            retry: RetryPolicy::default(),
            default_timeout_ms: None,
            task_service_url: None,
        }
    }
}

impl Settings {
    /// Creates default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker URL.
    #[must_use]
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Sets the queue prefix.
    #[must_use]
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Sets the dead-letter queue.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = queue.into();
        self
    }

    /// Sets the events queue.
    #[must_use]
    pub fn with_events_queue(mut self, queue: impl Into<String>) -> Self {
        self.events_queue = queue.into();
        self
    }

    /// Sets the default concurrency (at least 1).
    #[must_use]
    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    /// Overrides the concurrency of one node.
    #[must_use]
    pub fn with_node_concurrency(mut self, node: impl Into<String>, concurrency: usize) -> Self {
        self.concurrency.insert(node.into(), concurrency.max(1));
        self
    }

    /// Adds a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default handler timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the task service URL.
    #[must_use]
    pub fn with_task_service_url(mut self, url: impl Into<String>) -> Self {
        self.task_service_url = Some(url.into());
        self
    }

    /// Returns the concurrency of a node, at least 1: the per-node setting,
    /// else `declared` (the graph's value), else the default.
    #[must_use]
    pub fn concurrency_for(&self, node: &str, declared: Option<usize>) -> usize {
        self.concurrency
            .get(node)
            .copied()
            .or(declared)
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    /// Returns the default handler timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Parses settings, merging `profile` over `[default]`.
    ///
    /// Profile tables are merged key by key; nested tables (such as
    /// `retry`) are merged recursively.
    pub fn from_toml_str(content: &str, profile: Option<&str>) -> Result<Self, ConfigError> {
        let mut root: toml::Table =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut merged = match root.remove("default") {
            Some(toml::Value::Table(table)) => table,
            Some(_) => return Err(ConfigError::Parse("[default] must be a table".to_string())),
            None => toml::Table::new(),
        };

        if let Some(name) = profile {
            let overlay = root
                .get("profiles")
                .and_then(|profiles| profiles.get(name))
                .and_then(toml::Value::as_table)
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;
            merge_tables(&mut merged, overlay);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Applies `NODEFLOW_*` overrides from `vars`.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            match key {
                ENV_BROKER_URL => self.broker_url = value.into(),
                ENV_TASK_SERVICE_URL => self.task_service_url = Some(value.into()),
                ENV_CAPABILITIES => {
                    self.capabilities = value
                        .into()
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                ENV_DEFAULT_CONCURRENCY => {
                    let value = value.into();
                    self.default_concurrency = value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| ConfigError::InvalidEnv {
                            key: key.to_string(),
                            value,
                        })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Loads settings from a file, then applies the process environment.
    pub fn load(path: &Path, profile: Option<&str>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_toml_str(&content, profile)?;
        settings.apply_env(std::env::vars())?;
        Ok(settings)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: &toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
