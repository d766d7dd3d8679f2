//! Query descriptions and their in-memory evaluation.
//!
//! A [`Select`] is a finite, explicit description of what to fetch: one
//! model, an optional equi-join, conjunctive filters, ordering and a window.
//! Sessions receive it whole, so no query method is ever forwarded blindly.

use std::cmp::Ordering;

use serde_json::Value;

use crate::session::record::{Fields, Record};
use crate::session::types::TableName;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// SQL `LIKE` with `%` and `_`, case-insensitive.
    Like,
    /// Value must be a JSON array; matches if any element is equal.
    In,
    IsNull,
    IsNotNull,
}

/// One predicate on one column. Filters in a query are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Ge, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Like, Value::String(pattern.into()))
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, FilterOp::In, Value::Array(values))
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNull, Value::Null)
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNotNull, Value::Null)
    }

    /// Evaluate against a record's fields. A missing column reads as null.
    pub fn matches(&self, data: &Fields) -> bool {
        let null = Value::Null;
        let actual = data.get(&self.column).unwrap_or(&null);
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !actual.is_null() && !values_equal(actual, &self.value),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Like => match (actual, &self.value) {
                (Value::String(s), Value::String(p)) => like_match(s, p),
                _ => false,
            },
            FilterOp::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
                _ => false,
            },
            FilterOp::IsNull => actual.is_null(),
            FilterOp::IsNotNull => !actual.is_null(),
        }
    }
}

/// Sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// Inner equi-join against a second model.
///
/// Joined columns appear on the result as `"{table}.{column}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: TableName,
    /// column on the primary model
    pub left: String,
    /// column on the joined model
    pub right: String,
}

/// A complete query over one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: TableName,
    pub join: Option<Join>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Select {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            join: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Run this query over already-fetched rows.
    ///
    /// `joined` must hold the rows of `self.join`'s table when a join is set.
    pub fn evaluate(&self, rows: Vec<Record>, joined: &[Record]) -> Vec<Record> {
        let rows = match &self.join {
            Some(join) => join_rows(join, rows, joined),
            None => rows,
        };

        let mut rows: Vec<Record> = rows
            .into_iter()
            .filter(|r| self.filters.iter().all(|f| f.matches(&r.data)))
            .collect();

        if !self.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for ob in &self.order_by {
                    let cmp = compare_json_values(a.get(&ob.column), b.get(&ob.column));
                    if cmp != Ordering::Equal {
                        return if ob.ascending { cmp } else { cmp.reverse() };
                    }
                }
                Ordering::Equal
            });
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(self.offset).take(limit).collect()
    }
}

fn join_rows(join: &Join, left: Vec<Record>, right: &[Record]) -> Vec<Record> {
    let mut out = Vec::new();
    for l in left {
        let Some(lv) = l.get(&join.left) else { continue };
        let matches = |r: &&Record| r.get(&join.right).is_some_and(|rv| values_equal(lv, rv));
        for r in right.iter().filter(matches) {
            let mut combined = l.clone();
            for (col, value) in &r.data {
                combined
                    .data
                    .insert(format!("{}.{}", join.table, col), value.clone());
            }
            out.push(combined);
        }
    }
    out
}

/// Check if two JSON values are equal, comparing numbers numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .map(|(x, y)| (x - y).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

/// Compare two scalar JSON values of the same kind.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used for sorting; nulls and missing values sort first.
fn compare_json_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// SQL `LIKE` matching: `%` is any run, `_` any single char.
fn like_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    match_like(&s, &p, 0, 0)
}

fn match_like(s: &[char], p: &[char], si: usize, pi: usize) -> bool {
    if pi >= p.len() {
        return si >= s.len();
    }
    match p[pi] {
        '%' => (si..=s.len()).any(|i| match_like(s, p, i, pi + 1)),
        '_' => si < s.len() && match_like(s, p, si + 1, pi + 1),
        c => {
            si < s.len()
                && s[si].to_lowercase().eq(c.to_lowercase())
                && match_like(s, p, si + 1, pi + 1)
        }
    }
}
