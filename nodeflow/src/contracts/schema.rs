//! Structural schemas over payload maps.

use super::{PayloadContract, ValidationIssue};
use crate::core::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The JSON kind a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Any JSON value.
    #[default]
    Any,
    /// A JSON string.
    String,
    /// A JSON number without fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl FieldKind {
    /// Returns true if the value has this kind.
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

fn describe(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "number",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Kind and presence requirement of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected kind.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

impl FieldSpec {
    /// A required field of the given kind.
    #[must_use]
    pub fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }

    /// An optional field of the given kind.
    #[must_use]
    pub fn optional(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }
}

/// Parses the compact notation used in graph definition files:
/// `"boolean"` is required, `"boolean?"` is optional.
impl FromStr for FieldSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (name, required) = match trimmed.strip_suffix('?') {
            Some(rest) => (rest, false),
            None => (trimmed, true),
        };
        let kind = match name {
            "any" => FieldKind::Any,
            "string" | "str" => FieldKind::String,
            "integer" | "int" => FieldKind::Integer,
            "number" | "float" => FieldKind::Number,
            "boolean" | "bool" => FieldKind::Boolean,
            "array" | "list" => FieldKind::Array,
            "object" | "map" => FieldKind::Object,
            other => return Err(format!("unknown field kind '{other}'")),
        };
        Ok(Self { kind, required })
    }
}

/// A structural contract: named fields with kinds.
///
/// Extra fields are allowed unless the schema is [`Schema::strict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
    allow_extra: bool,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            allow_extra: true,
        }
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), FieldSpec::required(kind));
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), FieldSpec::optional(kind));
        self
    }

    /// Adds a field with an explicit spec.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(field.into(), spec);
        self
    }

    /// Rejects fields the schema does not declare.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.allow_extra = false;
        self
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldSpec> {
        &self.fields
    }
}

impl PayloadContract for Schema {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, payload: &Payload) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (field, spec) in &self.fields {
            match payload.get(field) {
                None | Some(serde_json::Value::Null) if spec.required => {
                    issues.push(ValidationIssue::for_field(field, "Required field is missing"));
                }
                None | Some(serde_json::Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    issues.push(ValidationIssue::for_field(
                        field,
                        format!("expected {}, found {}", spec.kind, describe(value)),
                    ));
                }
                Some(_) => {}
            }
        }

        if !self.allow_extra {
            for key in payload.keys() {
                if !self.fields.contains_key(key) {
                    issues.push(ValidationIssue::for_field(key, "Unexpected field"));
                }
            }
        }

        issues
    }

    fn field_names(&self) -> Option<Vec<String>> {
        Some(self.fields.keys().cloned().collect())
    }
}
