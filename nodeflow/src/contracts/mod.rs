//! Payload contracts for node inputs and outputs.
//!
//! This module provides:
//! - The [`PayloadContract`] trait checked by the worker around every handler
//! - [`Schema`], a structural contract over field names and kinds
//! - [`TypedContract`], a contract backed by a serde type

mod schema;
mod typed;

pub use schema::{FieldKind, FieldSpec, Schema};
pub use typed::TypedContract;

use crate::core::Payload;
use std::fmt;
use thiserror::Error;

/// Which side of a handler a contract guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Checked before the handler runs.
    Input,
    /// Checked on the handler's return value, before dispatch.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A single problem found while checking a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Field that caused the issue, if applicable.
    pub field: Option<String>,
    /// Issue description.
    pub message: String,
}

impl ValidationIssue {
    /// Creates an issue not tied to a field.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Creates an issue for a specific field.
    #[must_use]
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref field) = self.field {
            write!(f, "Field '{}': {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// A payload failed its declared contract.
///
/// Always permanent: the same payload fails the same way on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{direction} contract '{contract}' violated on node '{node}': {}", render(.issues))]
pub struct ContractViolation {
    /// Node whose contract failed.
    pub node: String,
    /// Input or output side.
    pub direction: Direction,
    /// Name of the contract.
    pub contract: String,
    /// Problems found.
    pub issues: Vec<ValidationIssue>,
}

impl ContractViolation {
    /// Creates a violation with a single issue.
    #[must_use]
    pub fn single(
        node: impl Into<String>,
        direction: Direction,
        contract: impl Into<String>,
        issue: ValidationIssue,
    ) -> Self {
        Self {
            node: node.into(),
            direction,
            contract: contract.into(),
            issues: vec![issue],
        }
    }
}

fn render(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A structural check over a payload map.
pub trait PayloadContract: Send + Sync + fmt::Debug {
    /// Returns the contract name used in diagnostics.
    fn name(&self) -> &str;

    /// Returns every problem found in the payload; empty means valid.
    fn check(&self, payload: &Payload) -> Vec<ValidationIssue>;

    /// Field names this contract is known to produce, when it can tell.
    ///
    /// Used at build time to reject conditions on fields a node never emits.
    fn field_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Checks the payload and converts problems into a violation.
    fn validate(
        &self,
        node: &str,
        direction: Direction,
        payload: &Payload,
    ) -> Result<(), ContractViolation> {
        let issues = self.check(payload);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ContractViolation {
                node: node.to_string(),
                direction,
                contract: self.name().to_string(),
                issues,
            })
        }
    }
}
