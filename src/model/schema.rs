//! Model schema definitions and validation.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ColumnDef, ColumnViolation, DataType};
use crate::session::TableName;

/// Schema of one entity model (one table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    /// Model/table name.
    pub name: TableName,
    /// Declared columns, in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the model was declared.
    pub created_at: DateTime<Utc>,
}

impl ModelSchema {
    /// Create a new model schema.
    pub fn new(name: TableName, columns: Vec<ColumnDef>) -> Self {
        Self {
            name,
            columns,
            description: None,
            created_at: Utc::now(),
        }
    }

    /// Start a [`ModelBuilder`].
    pub fn builder(name: TableName) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns carrying a `UNIQUE` constraint.
    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_unique())
    }

    /// Validate the schema itself.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(ModelError::DuplicateColumn(col.name.clone()));
            }
            if let Some(default) = col.default_value() {
                if !col.data_type.matches(default) {
                    return Err(ModelError::InvalidValue(format!(
                        "default for '{}' is not a {}",
                        col.name, col.data_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reject field names the model does not declare.
    ///
    /// This is a programming error on the caller's side, not a storage failure.
    pub fn check_fields<'a>(
        &self,
        fields: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), ModelError> {
        for field in fields {
            if !self.has_column(field) {
                return Err(ModelError::UnknownColumn {
                    model: self.name.to_string(),
                    column: field.clone(),
                });
            }
        }
        Ok(())
    }

    /// Fill in declared defaults for missing columns.
    pub fn apply_defaults(&self, data: &mut BTreeMap<String, Value>) {
        for col in &self.columns {
            if !data.contains_key(&col.name) {
                if let Some(default) = col.default_value() {
                    data.insert(col.name.clone(), default.clone());
                }
            }
        }
    }

    /// First column whose value violates type or nullability, if any.
    pub fn first_violation(
        &self,
        data: &BTreeMap<String, Value>,
    ) -> Option<(&ColumnDef, ColumnViolation)> {
        self.columns
            .iter()
            .find_map(|col| col.check(data.get(&col.name)).err().map(|v| (col, v)))
    }
}

/// Model-related errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("model '{model}' has no column '{column}'")]
    UnknownColumn { model: String, column: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Builder for model schemas.
pub struct ModelBuilder {
    name: TableName,
    columns: Vec<ColumnDef>,
    description: Option<String>,
}

impl ModelBuilder {
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            description: None,
        }
    }

    /// Add a plain nullable column.
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type));
        self
    }

    /// Add a fully specified column.
    pub fn column_def(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Build and validate the schema.
    pub fn build(self) -> Result<ModelSchema, ModelError> {
        let mut schema = ModelSchema::new(self.name, self.columns);
        schema.description = self.description;
        schema.validate()?;
        Ok(schema)
    }
}
