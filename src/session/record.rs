//! Entity records as the session hands them out.
//!
//! A record is a plain value: holding one does not keep anything attached to
//! a session. Writing it back goes through `Session::merge`, which is how a
//! "detached" entity becomes managed again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::types::RowKey;

/// Column values of one record.
pub type Fields = BTreeMap<String, Value>;

/// Turn a JSON object into [`Fields`]. Anything else yields `None`.
pub fn fields_from_value(value: Value) -> Option<Fields> {
    match value {
        Value::Object(map) => Some(map.into_iter().collect()),
        Value::Null => Some(Fields::new()),
        _ => None,
    }
}

/// One entity row with bookkeeping metadata.
///
/// Serialized form:
/// ```text
/// {
///   "_pk": "01hx...",
///   "_version": 1,
///   "_created_at": "xxxx-xx-xxT00:00:00Z",
///   "_updated_at": "xxxx-xx-xxT00:00:00Z",
///   "email": "a@x.com"
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// primary key
    pub key: RowKey,
    /// bumped on every merge of changed data
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    /// column values
    pub data: Fields,
}

impl Record {
    /// A fresh record at version 1.
    pub fn new(key: RowKey, data: Fields) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// A fresh record with a generated key.
    pub fn with_data(data: Fields) -> Self {
        Self::new(RowKey::generate(), data)
    }

    /// Overwrite the given columns, bumping version and timestamp.
    pub fn apply(&mut self, changes: Fields) {
        if changes.is_empty() {
            return;
        }
        for (k, v) in changes {
            self.data.insert(k, v);
        }
        self.version += 1;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// String value of a column, if it holds one.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Serialize to the `_pk`/`_version` JSON shape.
    pub fn to_json(&self) -> Value {
        let json = RecordJson {
            pk: self.key.as_str().to_string(),
            version: self.version,
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            data: self.data.clone(),
        };
        serde_json::to_value(json).unwrap_or(Value::Null)
    }
}

/// uses `_` prefix for metadata fields to avoid clashing with model columns
#[derive(Serialize, Deserialize)]
struct RecordJson {
    #[serde(rename = "_pk")]
    pk: String,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: Fields,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_creation() {
        let key = RowKey::new("test123").unwrap();
        let data = fields_from_value(json!({"name": "Alice", "age": 30})).unwrap();
        let record = Record::new(key.clone(), data);

        assert_eq!(record.key, key);
        assert_eq!(record.version, 1);
        assert_eq!(record.get_str("name"), Some("Alice"));
    }

    #[test]
    fn test_apply_bumps_version() {
        let mut record = Record::with_data(Fields::new());
        record.apply(Fields::new());
        assert_eq!(record.version, 1);

        record.apply(fields_from_value(json!({"email": "b@x.com"})).unwrap());
        assert_eq!(record.version, 2);
        assert_eq!(record.get_str("email"), Some("b@x.com"));
    }

    #[test]
    fn test_fields_from_value() {
        assert!(fields_from_value(json!([1, 2])).is_none());
        assert_eq!(fields_from_value(Value::Null), Some(Fields::new()));
    }

    #[test]
    fn test_json_shape() {
        let key = RowKey::new("abc").unwrap();
        let record = Record::new(key, fields_from_value(json!({"a_field": 1})).unwrap());
        let json = record.to_json();
        assert_eq!(json["_pk"], json!("abc"));
        assert_eq!(json["_version"], json!(1));
        assert_eq!(json["a_field"], json!(1));
    }
}
