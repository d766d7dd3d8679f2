//! Explicit query interface over one model.
//!
//! Builder methods never fail; the first invalid argument (an undeclared
//! column, a bad join target) is remembered and reported by whichever
//! terminal method runs next.

use std::sync::Arc;

use serde_json::Value;

use crate::crud::pagination::{self, Page, PageRequest};
use crate::model::ModelSchema;
use crate::session::{Filter, Join, OrderBy, Record, Select, Session, SessionError, TableName};
use crate::transaction::{TransactionError, TransactionResult};

/// A query being built against a session.
#[derive(Clone)]
pub struct Query {
    session: Arc<dyn Session>,
    schema: ModelSchema,
    select: Select,
    error: Option<TransactionError>,
}

impl Query {
    pub(crate) fn new(session: Arc<dyn Session>, schema: ModelSchema) -> Self {
        let select = Select::new(schema.name.clone());
        Self {
            session,
            schema,
            select,
            error: None,
        }
    }

    /// The query as it would be sent to the session.
    pub fn select(&self) -> &Select {
        &self.select
    }

    pub fn model(&self) -> &TableName {
        &self.schema.name
    }

    fn fail(&mut self, error: TransactionError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Declared on the model, or a `table.column` of the joined model.
    fn check_column(&mut self, column: &str) -> bool {
        if self.schema.has_column(column) {
            return true;
        }
        if let Some(join) = &self.select.join {
            if let Some(rest) = column.strip_prefix(join.table.as_str()) {
                if rest.starts_with('.') {
                    return true;
                }
            }
        }
        self.fail(TransactionError::UnknownField {
            model: self.schema.name.to_string(),
            field: column.to_string(),
        });
        false
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        if self.check_column(&filter.column) {
            self.select.filters.push(filter);
        }
        self
    }

    /// Equality filters from a JSON object of `column: value` pairs.
    pub fn filter_by(mut self, conditions: Value) -> Self {
        match conditions {
            Value::Object(map) => {
                for (column, value) in map {
                    self = self.filter(Filter::eq(column, value));
                }
            }
            Value::Null => {}
            other => self.fail(TransactionError::InvalidArgument(format!(
                "filter_by expects an object, got {}",
                other
            ))),
        }
        self
    }

    pub fn order_by(self, column: impl Into<String>) -> Self {
        self.order(column.into(), true)
    }

    pub fn order_by_desc(self, column: impl Into<String>) -> Self {
        self.order(column.into(), false)
    }

    fn order(mut self, column: String, ascending: bool) -> Self {
        if self.check_column(&column) {
            self.select.order_by.push(OrderBy { column, ascending });
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.select.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.select.offset = offset;
        self
    }

    /// Inner join `table` on `self.left == table.right`.
    pub fn join(mut self, table: &str, left: impl Into<String>, right: impl Into<String>) -> Self {
        let left = left.into();
        let table = match TableName::new(table) {
            Ok(t) => t,
            Err(e) => {
                self.fail(TransactionError::InvalidArgument(e.to_string()));
                return self;
            }
        };
        if self.check_column(&left) {
            self.select.join = Some(Join {
                table,
                left,
                right: right.into(),
            });
        }
        self
    }

    fn run(&self, select: &Select) -> TransactionResult<Vec<Record>> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        Ok(self.session.select(select)?)
    }

    pub fn all(&self) -> TransactionResult<Vec<Record>> {
        self.run(&self.select)
    }

    pub fn first(&self) -> TransactionResult<Option<Record>> {
        let mut select = self.select.clone();
        select.limit = Some(1);
        Ok(self.run(&select)?.into_iter().next())
    }

    /// Exactly one row, or a resource error.
    pub fn one(&self) -> TransactionResult<Record> {
        self.one_or_none()?
            .ok_or(TransactionError::Resource(SessionError::NoResultFound))
    }

    /// At most one row; more than one is a resource error.
    pub fn one_or_none(&self) -> TransactionResult<Option<Record>> {
        let mut select = self.select.clone();
        select.limit = Some(2);
        let mut rows = self.run(&select)?;
        if rows.len() > 1 {
            let count = self.count()?;
            return Err(SessionError::MultipleResultsFound { count }.into());
        }
        Ok(rows.pop())
    }

    pub fn count(&self) -> TransactionResult<usize> {
        Ok(self.all()?.len())
    }

    pub fn exists(&self) -> TransactionResult<bool> {
        Ok(self.first()?.is_some())
    }

    /// One page of the query. Counting ignores any limit or offset already set.
    pub fn paginate(&self, request: PageRequest) -> TransactionResult<Page<Record>> {
        let mut base = self.select.clone();
        base.limit = None;
        base.offset = 0;
        pagination::paginate(
            request,
            || Ok(self.run(&base)?.len()),
            |offset, limit| {
                let mut window = base.clone();
                window.offset = offset;
                window.limit = Some(limit);
                self.run(&window)
            },
        )
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("session", &self.session.id())
            .field("select", &self.select)
            .field("error", &self.error)
            .finish()
    }
}
