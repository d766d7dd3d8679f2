//! CRUD scope: one model, one scope guard.
//!
//! Every write marks the guard dirty (opening its savepoint) before touching
//! the session. A resource error is recorded on the guard, which rolls the
//! savepoint back and flags the innermost error boundary; the call returns
//! `Ok(None)`/`Ok(false)` under the swallow policy or the error under raise.
//! Any other error is recorded and always returned. A write that matches
//! nothing reports `NotFound` and rolls nothing back.

use serde_json::Value;

use crate::crud::query::Query;
use crate::crud::status::Status;
use crate::model::ModelSchema;
use crate::session::{fields_from_value, Fields, Filter, Record, TableName};
use crate::transaction::{
    Cleanup, ErrorPolicy, ScopeGuard, ScopeOptions, TransactionError, TransactionManager,
    TransactionResult,
};

/// Caller-facing unit of work on one model.
///
/// Close it with [`Crud::close`] (or [`Crud::abort`] after a failure). A
/// dropped `Crud` exits its scope as failed.
#[derive(Debug)]
pub struct Crud {
    guard: ScopeGuard,
    model: TableName,
    schema: ModelSchema,
    defaults: Fields,
    global_filters: Vec<Filter>,
    apply_global_filters: bool,
    status: Status,
}

impl Crud {
    /// Open a scope on `model`.
    ///
    /// `defaults` must be a JSON object (or null) of declared fields. They
    /// fill in missing fields on `add` and filter every instance query.
    pub fn open(
        manager: &TransactionManager,
        model: &str,
        defaults: Value,
    ) -> TransactionResult<Self> {
        let model = TableName::new(model)
            .map_err(|e| TransactionError::InvalidArgument(e.to_string()))?;
        let defaults = fields_from_value(defaults).ok_or_else(|| {
            TransactionError::InvalidArgument("defaults must be a JSON object".into())
        })?;

        // resolved before entering, so a bad model never touches the scope
        let schema = manager.session().schema(&model).map_err(|e| {
            TransactionError::InvalidArgument(format!("unknown model '{}': {}", model, e))
        })?;
        schema.check_fields(defaults.keys())?;

        let guard = manager.scope_with(ScopeOptions::new().label(model.as_str()))?;
        Ok(Self {
            guard,
            model,
            schema,
            defaults,
            global_filters: manager.config().global_filters.clone(),
            apply_global_filters: true,
            status: Status::Ok,
        })
    }

    pub fn model(&self) -> &TableName {
        &self.model
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn defaults(&self) -> &Fields {
        &self.defaults
    }

    /// The scope this CRUD runs in.
    pub fn scope(&self) -> &ScopeGuard {
        &self.guard
    }

    /// Status of the last operation.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Error recorded on the scope, if any.
    pub fn error(&self) -> Option<&TransactionError> {
        self.guard.error()
    }

    /// Set this scope's error policy. A running transactional function
    /// still takes precedence.
    pub fn error_policy(&mut self, policy: ErrorPolicy) -> &mut Self {
        self.guard.set_error_policy(policy);
        self
    }

    pub fn disable_global_filter(&mut self, disable: bool) -> &mut Self {
        self.apply_global_filters = !disable;
        self
    }

    // -- writes --

    /// Insert one entity built from a JSON object.
    pub fn add(&mut self, data: Value) -> TransactionResult<Option<Record>> {
        self.write("add", |crud| {
            let fields = crud.fields(data)?;
            let record = Record::with_data(crud.with_defaults(fields));
            Ok(Some(crud.guard.session().merge(&crud.model, record)?))
        })
    }

    /// Insert several entities atomically.
    pub fn add_all(&mut self, items: Vec<Value>) -> TransactionResult<Option<Vec<Record>>> {
        self.write("add_all", |crud| {
            let mut records = Vec::with_capacity(items.len());
            for item in items {
                let fields = crud.fields(item)?;
                records.push(Record::with_data(crud.with_defaults(fields)));
            }
            Ok(Some(crud.guard.session().add_all(&crud.model, records)?))
        })
    }

    /// Merge a detached record into the session, applying `changes` to the
    /// managed copy. `record` itself is left untouched.
    pub fn add_record(
        &mut self,
        record: &Record,
        changes: Value,
    ) -> TransactionResult<Option<Record>> {
        self.write("add_record", |crud| {
            let changes = crud.fields(changes)?;
            crud.schema.check_fields(record.data.keys())?;
            let mut managed = record.clone();
            managed.apply(changes);
            Ok(Some(crud.guard.session().merge(&crud.model, managed)?))
        })
    }

    /// Apply `changes` to an existing entity.
    pub fn update(&mut self, record: &Record, changes: Value) -> TransactionResult<Option<Record>> {
        self.write("update", |crud| {
            let changes = crud.fields(changes)?;
            if crud.guard.session().get(&crud.model, &record.key)?.is_none() {
                return Ok(None);
            }
            let mut managed = record.clone();
            managed.apply(changes);
            Ok(Some(crud.guard.session().merge(&crud.model, managed)?))
        })
    }

    /// Apply `changes` to the first entity of the instance query.
    pub fn update_first(&mut self, changes: Value) -> TransactionResult<Option<Record>> {
        self.write("update_first", |crud| {
            let changes = crud.fields(changes)?;
            let Some(mut managed) = crud.query().first()? else {
                return Ok(None);
            };
            managed.apply(changes);
            Ok(Some(crud.guard.session().merge(&crud.model, managed)?))
        })
    }

    pub fn delete(&mut self, record: &Record) -> TransactionResult<bool> {
        let deleted = self.write("delete", |crud| {
            let session = crud.guard.session();
            if session.get(&crud.model, &record.key)?.is_none() {
                return Ok(None);
            }
            session.delete(&crud.model, &record.key)?;
            Ok(Some(()))
        })?;
        Ok(deleted.is_some())
    }

    /// Delete the first match of `query` (the instance query if `None`), or
    /// every match with `all_records`.
    pub fn delete_where(
        &mut self,
        query: Option<Query>,
        all_records: bool,
    ) -> TransactionResult<bool> {
        let deleted = self.write("delete_where", |crud| {
            let query = query.unwrap_or_else(|| crud.query());
            let rows = if all_records {
                query.all()?
            } else {
                query.first()?.into_iter().collect()
            };
            if rows.is_empty() {
                return Ok(None);
            }
            let session = crud.guard.session();
            for row in &rows {
                session.delete(&crud.model, &row.key)?;
            }
            Ok(Some(rows.len()))
        })?;
        Ok(deleted.is_some())
    }

    // -- reads --

    /// Query filtered by the instance defaults and, unless disabled, the
    /// global filters of every column this model declares.
    pub fn query(&self) -> Query {
        let mut query = self.query_pure();
        for (column, value) in &self.defaults {
            query = query.filter(Filter::eq(column.clone(), value.clone()));
        }
        if self.apply_global_filters {
            for filter in &self.global_filters {
                if self.schema.has_column(&filter.column) {
                    query = query.filter(filter.clone());
                }
            }
        }
        query
    }

    /// Query with no default or global filters.
    pub fn query_pure(&self) -> Query {
        Query::new(self.guard.session().clone(), self.schema.clone())
    }

    pub fn first(&mut self) -> TransactionResult<Option<Record>> {
        let result = self.query().first();
        self.read(result)
    }

    pub fn all(&mut self) -> TransactionResult<Vec<Record>> {
        let result = self.query().all();
        self.read(result)
    }

    // -- control --

    /// Mark the scope as having pending changes without writing anything.
    pub fn need_commit(&mut self) -> TransactionResult<()> {
        self.guard.mark_dirty()
    }

    /// Resolve pending changes now.
    pub fn commit(&mut self) -> TransactionResult<()> {
        let result = self.guard.commit();
        self.status = match (&result, self.guard.error()) {
            (Err(e), _) => e.status(),
            (Ok(()), Some(e)) if !self.guard.explicitly_committed() => e.status(),
            _ => Status::Ok,
        };
        result
    }

    /// Throw away pending changes; nothing is committed at close.
    pub fn discard(&mut self) -> Cleanup {
        self.guard.discard()
    }

    /// Exit the scope after a successful body.
    pub fn close(self) -> TransactionResult<()> {
        self.guard.close()
    }

    /// Exit the scope as failed.
    pub fn abort(self) -> TransactionResult<()> {
        self.guard.exit(true)
    }

    // -- helpers --

    /// Validate a JSON object of field values against the model.
    fn fields(&self, value: Value) -> TransactionResult<Fields> {
        let fields = fields_from_value(value).ok_or_else(|| {
            TransactionError::InvalidArgument(format!(
                "{}: field values must be a JSON object",
                self.model
            ))
        })?;
        self.schema.check_fields(fields.keys())?;
        Ok(fields)
    }

    fn with_defaults(&self, fields: Fields) -> Fields {
        let mut merged = self.defaults.clone();
        merged.extend(fields);
        merged
    }

    /// Run a write, mapping its outcome to a status. `Ok(None)` from `op`
    /// means it matched nothing.
    fn write<T, F>(&mut self, op: &'static str, f: F) -> TransactionResult<Option<T>>
    where
        F: FnOnce(&Self) -> TransactionResult<Option<T>>,
    {
        self.status = Status::Ok;
        if let Err(e) = self.guard.mark_dirty() {
            return self.fail(op, e);
        }
        match f(self) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                tracing::debug!(model = %self.model, op, "nothing matched");
                self.status = Status::NotFound;
                Ok(None)
            }
            Err(e) => self.fail(op, e),
        }
    }

    fn fail<T>(
        &mut self,
        op: &'static str,
        error: TransactionError,
    ) -> TransactionResult<Option<T>> {
        self.status = error.status();
        let swallow = error.is_resource() && !self.guard.error_policy().raises();
        if !error.is_resource() {
            tracing::error!(model = %self.model, op, error = %error, "operation failed");
        }
        let cleanup = self.guard.record_error(error.clone());
        if cleanup.is_failed() {
            tracing::error!(model = %self.model, op, %cleanup, "savepoint rollback failed");
        }
        if swallow {
            Ok(None)
        } else {
            Err(error)
        }
    }

    fn read<T>(&mut self, result: TransactionResult<T>) -> TransactionResult<T> {
        self.status = match &result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::model::{ColumnDef, DataType};
    use crate::session::{Fault, MemorySession, SessionError};
    use serde_json::json;

    fn setup(config: Config) -> (Arc<MemorySession>, TransactionManager) {
        let session = Arc::new(MemorySession::new());
        let users = ModelSchema::builder(TableName::new("users").unwrap())
            .column_def(ColumnDef::new("email", DataType::Text).required().unique())
            .column("name", DataType::Text)
            .column_def(
                ColumnDef::new("deleted", DataType::Boolean)
                    .with_constraint(crate::model::Constraint::Default(json!(false))),
            )
            .build()
            .unwrap();
        let tags = ModelSchema::builder(TableName::new("tags").unwrap())
            .column("label", DataType::Text)
            .build()
            .unwrap();
        session.create_table(users).unwrap();
        session.create_table(tags).unwrap();
        let manager = TransactionManager::for_session(session.clone(), config);
        (session, manager)
    }

    fn users() -> TableName {
        TableName::new("users").unwrap()
    }

    #[test]
    fn test_add_and_close_commits() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        let record = crud.add(json!({"email": "a@x.com"})).unwrap().unwrap();
        assert_eq!(record.get("deleted"), Some(&json!(false)));
        assert_eq!(crud.status(), Status::Ok);
        crud.close().unwrap();

        let rows = session.committed_rows(&users()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("email"), Some("a@x.com"));
    }

    #[test]
    fn test_unknown_field_always_raises() {
        let (session, manager) = setup(Config::new().error_policy(ErrorPolicy::Swallow));
        let mut crud = manager.crud("users").unwrap();
        let err = crud.add(json!({"email": "a@x.com", "nickname": "a"})).unwrap_err();
        assert!(matches!(err, TransactionError::UnknownField { .. }));
        assert_eq!(crud.status(), Status::InternalError);
        crud.close().unwrap();
        assert!(session.committed_rows(&users()).unwrap().is_empty());
    }

    #[test]
    fn test_resource_error_raise_and_swallow() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.add(json!({"email": "a@x.com"})).unwrap();
        let err = crud.add(json!({"email": "a@x.com"})).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Resource(SessionError::UniqueViolation { .. })
        ));
        assert_eq!(crud.status(), Status::ResourceError);
        crud.close().unwrap();
        assert!(session.committed_rows(&users()).unwrap().is_empty());

        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.error_policy(ErrorPolicy::Swallow);
        session.fail_next(Fault::Write);
        assert_eq!(crud.add(json!({"email": "b@x.com"})).unwrap(), None);
        assert_eq!(crud.status(), Status::ResourceError);
        assert!(crud.error().is_some_and(TransactionError::is_resource));
        crud.close().unwrap();
        assert!(session.committed_rows(&users()).unwrap().is_empty());
    }

    #[test]
    fn test_not_found_rolls_nothing_back() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.add(json!({"email": "a@x.com"})).unwrap();

        let missing = Record::with_data(Fields::new());
        assert_eq!(crud.update(&missing, json!({"name": "x"})).unwrap(), None);
        assert_eq!(crud.status(), Status::NotFound);
        assert!(!crud.delete(&missing).unwrap());
        assert_eq!(crud.status(), Status::NotFound);
        assert!(crud.error().is_none());

        crud.close().unwrap();
        assert_eq!(session.committed_rows(&users()).unwrap().len(), 1);
    }

    #[test]
    fn test_defaults_fill_and_filter() {
        let (_session, manager) = setup(Config::default());
        let mut plain = manager.crud("users").unwrap();
        plain.add(json!({"email": "a@x.com", "name": "ann"})).unwrap();

        let mut bobs = manager.crud_with("users", json!({"name": "bob"})).unwrap();
        let bob = bobs.add(json!({"email": "b@x.com"})).unwrap().unwrap();
        assert_eq!(bob.get_str("name"), Some("bob"));
        assert_eq!(bobs.all().unwrap().len(), 1);
        assert_eq!(bobs.query_pure().count().unwrap(), 2);
        bobs.close().unwrap();
        plain.close().unwrap();

        assert!(matches!(
            manager.crud_with("users", json!({"nickname": "x"})),
            Err(TransactionError::UnknownField { .. })
        ));
        assert!(matches!(
            manager.crud_with("users", json!([1])),
            Err(TransactionError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.crud("nope"),
            Err(TransactionError::InvalidArgument(_))
        ));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_global_filters() {
        let config = Config::new().global_filter(Filter::eq("deleted", false));
        let (_session, manager) = setup(config);
        let mut crud = manager.crud("users").unwrap();
        crud.add(json!({"email": "a@x.com"})).unwrap();
        crud.add(json!({"email": "b@x.com", "deleted": true})).unwrap();
        assert_eq!(crud.all().unwrap().len(), 1);
        crud.disable_global_filter(true);
        assert_eq!(crud.all().unwrap().len(), 2);
        crud.close().unwrap();

        // models without the column are unaffected
        let mut tags = manager.crud("tags").unwrap();
        tags.add(json!({"label": "x"})).unwrap();
        assert_eq!(tags.all().unwrap().len(), 1);
        tags.close().unwrap();
    }

    #[test]
    fn test_add_record_leaves_source_untouched() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        let source = crud.add(json!({"email": "a@x.com"})).unwrap().unwrap();
        crud.close().unwrap();

        let mut crud = manager.crud("users").unwrap();
        let managed = crud
            .add_record(&source, json!({"name": "ann"}))
            .unwrap()
            .unwrap();
        assert_eq!(managed.get_str("name"), Some("ann"));
        assert_eq!(source.get("name"), None);
        crud.close().unwrap();
        assert_eq!(session.committed_rows(&users()).unwrap()[0].get_str("name"), Some("ann"));
    }

    #[test]
    fn test_update_first_and_delete_where() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.add_all(vec![
            json!({"email": "a@x.com", "name": "ann"}),
            json!({"email": "b@x.com", "name": "ann"}),
            json!({"email": "c@x.com", "name": "cy"}),
        ])
        .unwrap();

        let mut cys = manager.crud_with("users", json!({"name": "cy"})).unwrap();
        let updated = cys.update_first(json!({"email": "cy@x.com"})).unwrap().unwrap();
        assert_eq!(updated.version, 2);
        cys.close().unwrap();

        let anns = crud.query().filter_by(json!({"name": "ann"}));
        assert!(crud.delete_where(Some(anns), true).unwrap());
        let nobody = crud.query().filter_by(json!({"name": "zed"}));
        assert!(!crud.delete_where(Some(nobody), false).unwrap());
        assert_eq!(crud.status(), Status::NotFound);
        crud.close().unwrap();

        let rows = session.committed_rows(&users()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("email"), Some("cy@x.com"));
    }

    #[test]
    fn test_discard_and_explicit_commit() {
        let (session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.add(json!({"email": "a@x.com"})).unwrap();
        crud.discard();
        crud.close().unwrap();
        assert!(session.committed_rows(&users()).unwrap().is_empty());

        let mut crud = manager.crud("users").unwrap();
        crud.add(json!({"email": "a@x.com"})).unwrap();
        crud.commit().unwrap();
        assert_eq!(crud.status(), Status::Ok);
        crud.close().unwrap();
        assert_eq!(session.committed_rows(&users()).unwrap().len(), 1);
    }

    #[test]
    fn test_need_commit_without_write() {
        let (_session, manager) = setup(Config::default());
        let mut crud = manager.crud("users").unwrap();
        crud.need_commit().unwrap();
        assert!(crud.scope().needs_commit());
        crud.close().unwrap();
    }
}
