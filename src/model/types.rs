//! Column types and constraints for entity models.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value types a model column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Text/string data.
    Text,
    /// Whole numbers.
    Integer,
    /// Floating point numbers (integers are accepted too).
    Float,
    /// Boolean values.
    Boolean,
    /// JSON objects or arrays.
    Json,
    /// RFC 3339 timestamps stored as strings.
    Timestamp,
}

impl DataType {
    /// Check if a JSON value is acceptable for this type.
    ///
    /// `null` is handled by the column's nullability, not here.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (DataType::Text, Value::String(_)) => true,
            (DataType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (DataType::Float, Value::Number(_)) => true,
            (DataType::Boolean, Value::Bool(_)) => true,
            (DataType::Json, Value::Object(_) | Value::Array(_)) => true,
            (DataType::Timestamp, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
            }
            _ => false,
        }
    }

    /// Short lowercase name, as accepted by [`DataType::parse`].
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Json => "json",
            DataType::Timestamp => "timestamp",
        }
    }

    /// Parse a type name (case-insensitive, a few common aliases).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "string" | "str" => Some(DataType::Text),
            "integer" | "int" => Some(DataType::Integer),
            "float" | "real" => Some(DataType::Float),
            "boolean" | "bool" => Some(DataType::Boolean),
            "json" => Some(DataType::Json),
            "timestamp" => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Column constraints enforced by the session on flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Column cannot be null or missing.
    NotNull,
    /// Column values must be unique across all rows of the model.
    Unique,
    /// Value filled in when the column is missing on insert.
    Default(Value),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::NotNull => write!(f, "NOT NULL"),
            Constraint::Unique => write!(f, "UNIQUE"),
            Constraint::Default(v) => write!(f, "DEFAULT {}", v),
        }
    }
}

/// A declared model column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Data type.
    pub data_type: DataType,
    /// Constraints on this column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl ColumnDef {
    /// Create a new nullable, non-unique column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            constraints: Vec::new(),
        }
    }

    /// Add a constraint to this column.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Shorthand for `NOT NULL`.
    pub fn required(self) -> Self {
        self.with_constraint(Constraint::NotNull)
    }

    /// Shorthand for `UNIQUE`.
    pub fn unique(self) -> Self {
        self.with_constraint(Constraint::Unique)
    }

    pub fn is_nullable(&self) -> bool {
        !self.constraints.iter().any(|c| matches!(c, Constraint::NotNull))
    }

    pub fn is_unique(&self) -> bool {
        self.constraints.iter().any(|c| matches!(c, Constraint::Unique))
    }

    /// Get the default value, if any.
    pub fn default_value(&self) -> Option<&Value> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Default(v) => Some(v),
            _ => None,
        })
    }

    /// Check a (possibly missing) value against type and nullability.
    pub fn check(&self, value: Option<&Value>) -> Result<(), ColumnViolation> {
        match value {
            None | Some(Value::Null) => {
                if self.is_nullable() {
                    Ok(())
                } else {
                    Err(ColumnViolation::Null)
                }
            }
            Some(v) if self.data_type.matches(v) => Ok(()),
            Some(v) => Err(ColumnViolation::Type {
                expected: self.data_type,
                found: v.clone(),
            }),
        }
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        for constraint in &self.constraints {
            write!(f, " {}", constraint)?;
        }
        Ok(())
    }
}

/// Why a value was rejected by [`ColumnDef::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnViolation {
    Null,
    Type { expected: DataType, found: Value },
}
