//! Function-level transactional wrapper.
//!
//! One call of a wrapped function is one scope. While it runs, its error
//! policy sits on the ambient policy stack, so every ad-hoc scope the
//! function opens resolves to it.
//!
//! With `join(false)` inside an ambient root, the call runs in its own
//! savepoint: anything that fails inside it, including nested CRUD scopes,
//! is rolled back there and leaves the caller's transaction alone.

use crate::transaction::error::TransactionError;
use crate::transaction::manager::TransactionManager;
use crate::transaction::policy::ErrorPolicy;
use crate::transaction::scope::ScopeOptions;

/// Builder returned by [`TransactionManager::transaction`].
#[derive(Debug, Clone)]
pub struct Transactional {
    manager: TransactionManager,
    join: bool,
    error_policy: Option<ErrorPolicy>,
    label: String,
}

impl Transactional {
    pub(crate) fn new(manager: TransactionManager) -> Self {
        let join = manager.config().join;
        Self {
            manager,
            join,
            error_policy: None,
            label: "transaction".to_string(),
        }
    }

    /// Attach to an ambient scope (default) or always run independently.
    pub fn join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Policy this wrapper pushes for the duration of a call.
    pub fn resolved_policy(&self) -> ErrorPolicy {
        self.error_policy.unwrap_or(self.manager.config().error_policy)
    }

    /// Run `f` inside one scope.
    ///
    /// `Ok` exits the scope normally, `Err` exits it as failed.
    pub fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<TransactionError>,
    {
        let policy = self.resolved_policy();
        let _frame = self.manager.policies().push(policy);
        let options = ScopeOptions::new()
            .label(self.label.clone())
            .join(self.join)
            .error_policy(policy);
        self.manager.with_scope(options, |_| f())
    }

    /// Turn `f` into a function that runs every call in its own scope.
    pub fn wrap<A, T, E, F>(self, f: F) -> impl Fn(A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        E: From<TransactionError>,
    {
        move |arg| self.run(|| f(arg))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::model::{ColumnDef, DataType, ModelSchema};
    use crate::session::{MemorySession, SessionEvent, TableName};
    use crate::transaction::error::TransactionResult;
    use serde_json::json;

    #[test]
    fn test_policy_visible_inside_call() {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(session, Config::default());
        let txn = manager.transaction().error_policy(ErrorPolicy::Swallow);

        let seen: TransactionResult<_> = txn.run(|| Ok(manager.current_error_policy()));
        assert_eq!(seen.unwrap(), Some(ErrorPolicy::Swallow));
        assert_eq!(manager.current_error_policy(), None);
    }

    #[test]
    fn test_wrapped_function_opens_one_scope_per_call() {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(session.clone(), Config::default());
        let inner = manager.clone();
        let double = manager.transaction().wrap(move |n: u32| -> TransactionResult<u32> {
            let scope = inner.scope()?;
            assert!(scope.joined());
            scope.close()?;
            Ok(n * 2)
        });

        assert_eq!(double(2).unwrap(), 4);
        assert_eq!(double(5).unwrap(), 10);
        let commits = session
            .journal()
            .iter()
            .filter(|e| **e == SessionEvent::Commit)
            .count();
        assert_eq!(commits, 2);
    }

    #[test]
    fn test_join_false_inside_ambient_scope() {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(session.clone(), Config::default());
        let outer = manager.scope().unwrap();

        let result: TransactionResult<()> = manager
            .transaction()
            .join(false)
            .run(|| Err(TransactionError::Internal("boom".into())));
        assert!(result.is_err());
        assert!(!outer.state().unwrap().error);
        let rolled_back = session
            .journal()
            .iter()
            .any(|e| matches!(e, SessionEvent::SavepointRollback(_)));
        assert!(rolled_back);
        outer.close().unwrap();
        assert_eq!(session.journal().last(), Some(&SessionEvent::Commit));
    }

    #[test]
    fn test_join_false_contains_swallowed_crud_failure() {
        let session = Arc::new(MemorySession::new());
        let users = TableName::new("users").unwrap();
        let schema = ModelSchema::builder(users.clone())
            .column_def(ColumnDef::new("email", DataType::Text).required().unique())
            .build()
            .unwrap();
        session.create_table(schema).unwrap();
        let manager = TransactionManager::for_session(session.clone(), Config::default());

        let mut outer = manager.crud("users").unwrap();
        outer.add(json!({"email": "keep@x.com"})).unwrap();

        let independent = manager.transaction().join(false).error_policy(ErrorPolicy::Swallow);
        let result: TransactionResult<()> = independent.run(|| {
            let mut crud = manager.crud("users")?;
            crud.add(json!({"email": "new@x.com"}))?;
            assert_eq!(crud.add(json!({"email": "keep@x.com"}))?, None);
            crud.close()
        });
        assert!(result.is_ok());
        assert!(!outer.scope().state().unwrap().error);

        // second savepoint opened is the independent call's own
        let journal = session.journal();
        let independent_sp = journal
            .iter()
            .filter_map(|e| match e {
                SessionEvent::SavepointBegin(id) => Some(*id),
                _ => None,
            })
            .nth(1)
            .unwrap();
        assert!(journal.contains(&SessionEvent::SavepointRollback(independent_sp)));

        outer.close().unwrap();
        let rows = session.committed_rows(&users).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("email"), Some("keep@x.com"));
    }
}
