//! End-to-end scope behavior against the in-memory session.

use std::sync::Arc;

use crudtx::config::Config;
use crudtx::crud::Status;
use crudtx::model::{ColumnDef, DataType, ModelSchema};
use crudtx::session::{
    Fault, MemorySession, Record, RowKey, Session, SessionEvent, TableName, TxnOrigin,
};
use crudtx::transaction::{
    ErrorPolicy, ExistingTxnPolicy, RootOrigin, TransactionError, TransactionManager,
    TransactionResult,
};
use serde_json::json;

fn users() -> TableName {
    TableName::new("users").unwrap()
}

fn setup(config: Config) -> (Arc<MemorySession>, TransactionManager) {
    let session = Arc::new(MemorySession::new());
    let schema = ModelSchema::builder(users())
        .column_def(ColumnDef::new("email", DataType::Text).required().unique())
        .column("name", DataType::Text)
        .build()
        .unwrap();
    session.create_table(schema).unwrap();
    let manager = TransactionManager::for_session(session.clone(), config);
    (session, manager)
}

fn emails(session: &MemorySession) -> Vec<String> {
    let mut emails: Vec<String> = session
        .committed_rows(&users())
        .unwrap()
        .iter()
        .filter_map(|r| r.get_str("email").map(str::to_string))
        .collect();
    emails.sort();
    emails
}

fn count(session: &MemorySession, event: SessionEvent) -> usize {
    session.journal().iter().filter(|e| **e == event).count()
}

fn root_begins(session: &MemorySession) -> usize {
    session
        .journal()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Begin(_)))
        .count()
}

#[test]
fn test_scenario_a_single_scope_commits() {
    let (session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    crud.close().unwrap();

    assert_eq!(emails(&session), vec!["a@x.com"]);
    assert_eq!(root_begins(&session), 1);
    assert_eq!(count(&session, SessionEvent::Commit), 1);
}

#[test]
fn test_scenario_b_inner_failure_is_sticky() {
    let (session, manager) = setup(Config::default());
    let mut outer = manager.crud("users").unwrap();
    outer.add(json!({"email": "e1@x.com"})).unwrap();

    let inner: TransactionResult<()> = manager.with_crud("users", |crud| {
        crud.add(json!({"email": "e2@x.com"}))?;
        Err(TransactionError::Internal("inner body failed".into()))
    });
    assert!(inner.is_err());
    assert!(outer.scope().state().unwrap().error);

    outer.close().unwrap();
    assert!(emails(&session).is_empty());
    assert_eq!(session.journal().last(), Some(&SessionEvent::Rollback));
    assert_eq!(count(&session, SessionEvent::Commit), 0);
}

#[test]
fn test_scenario_c_discard() {
    let (session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    crud.discard();
    crud.close().unwrap();

    assert!(emails(&session).is_empty());
    assert_eq!(count(&session, SessionEvent::Commit), 0);

    // later reads on the same session do not see the discarded row
    let mut crud = manager.crud("users").unwrap();
    assert!(crud.all().unwrap().is_empty());
    crud.close().unwrap();
}

#[test]
fn test_scenario_d_decorated_function_commits_once() {
    let (session, manager) = setup(Config::default());
    let inner = manager.clone();
    let signup = manager.transaction().wrap(move |email: String| -> TransactionResult<()> {
        inner.with_crud("users", |crud| crud.add(json!({"email": email})).map(|_| ()))?;
        inner.with_crud("users", |crud| {
            crud.add(json!({"email": format!("audit+{}", email)})).map(|_| ())
        })?;
        Ok(())
    });

    signup("a@x.com".to_string()).unwrap();
    assert_eq!(emails(&session), vec!["a@x.com", "audit+a@x.com"]);
    assert_eq!(root_begins(&session), 1);
    assert_eq!(count(&session, SessionEvent::Commit), 1);
}

#[test]
fn test_nested_scopes_share_one_root() {
    let (session, manager) = setup(Config::default());
    let mut scopes = Vec::new();
    for i in 0..4 {
        let mut crud = manager.crud("users").unwrap();
        assert_eq!(crud.scope().joined(), i > 0);
        crud.add(json!({"email": format!("{}@x.com", i)})).unwrap();
        scopes.push(crud);
    }
    while let Some(crud) = scopes.pop() {
        crud.close().unwrap();
        if !scopes.is_empty() {
            assert!(emails(&session).is_empty());
        }
    }

    assert_eq!(emails(&session).len(), 4);
    assert_eq!(root_begins(&session), 1);
    assert_eq!(count(&session, SessionEvent::Commit), 1);
    assert_eq!(count(&session, SessionEvent::Rollback), 0);
}

#[test]
fn test_resource_error_in_swallowing_scope_still_rolls_back_root() {
    let (session, manager) = setup(Config::default());
    let mut outer = manager.crud("users").unwrap();
    outer.add(json!({"email": "a@x.com"})).unwrap();

    let mut inner = manager.crud("users").unwrap();
    inner.error_policy(ErrorPolicy::Swallow);
    assert_eq!(inner.add(json!({"email": "a@x.com"})).unwrap(), None);
    assert_eq!(inner.status(), Status::ResourceError);
    inner.close().unwrap();

    // the outer scope reports nothing of its own
    assert!(outer.error().is_none());
    outer.close().unwrap();
    assert!(emails(&session).is_empty());
    assert_eq!(session.journal().last(), Some(&SessionEvent::Rollback));
}

#[test]
fn test_explicit_commit_is_idempotent() {
    let (session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    crud.commit().unwrap();
    crud.close().unwrap();

    let releases = session
        .journal()
        .iter()
        .filter(|e| matches!(e, SessionEvent::SavepointRelease(_)))
        .count();
    assert_eq!(releases, 1);
    assert_eq!(count(&session, SessionEvent::Commit), 1);
    assert_eq!(emails(&session), vec!["a@x.com"]);
}

#[test]
fn test_sequential_scopes_see_clean_root() {
    let (session, manager) = setup(Config::default());
    for i in 0..3 {
        let mut crud = manager.crud("users").unwrap();
        let state = crud.scope().state().unwrap();
        assert_eq!(state.depth, 1);
        assert!(!state.error);
        assert!(!crud.scope().joined());
        crud.add(json!({"email": format!("{}@x.com", i)})).unwrap();
        if i == 1 {
            crud.abort().unwrap();
        } else {
            crud.close().unwrap();
        }
    }
    assert_eq!(emails(&session), vec!["0@x.com", "2@x.com"]);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn test_decorator_policy_overrides_scope_policy() {
    let (session, manager) = setup(Config::default());
    let inner = manager.clone();
    let swallowing = manager.transaction().error_policy(ErrorPolicy::Swallow);

    let result: TransactionResult<Option<Record>> = swallowing.run(|| {
        let mut crud = inner.crud("users")?;
        crud.error_policy(ErrorPolicy::Raise);
        session.fail_next(Fault::Write);
        let added = crud.add(json!({"email": "a@x.com"}))?;
        assert_eq!(crud.status(), Status::ResourceError);
        crud.close()?;
        Ok(added)
    });
    assert_eq!(result.unwrap(), None);
    assert!(emails(&session).is_empty());
}

#[test]
fn test_internal_error_raises_under_swallow() {
    let (_session, manager) = setup(Config::new().error_policy(ErrorPolicy::Swallow));
    let mut crud = manager.crud("users").unwrap();
    let err = crud.add(json!({"email": "a@x.com", "age": 3})).unwrap_err();
    assert!(matches!(err, TransactionError::UnknownField { ref field, .. } if field == "age"));
    assert_eq!(crud.status(), Status::InternalError);
    crud.close().unwrap();
}

#[test]
fn test_root_begin_failure_fails_entry() {
    let (session, manager) = setup(Config::default());
    session.fail_next(Fault::Begin);
    let err = manager.crud("users").unwrap_err();
    assert!(matches!(err, TransactionError::Begin { nested: false, .. }));
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn test_savepoint_begin_failure_is_fatal() {
    let (session, manager) = setup(Config::new().error_policy(ErrorPolicy::Swallow));
    let mut crud = manager.crud("users").unwrap();
    session.fail_next(Fault::BeginNested);
    let err = crud.add(json!({"email": "a@x.com"})).unwrap_err();
    assert!(matches!(err, TransactionError::Begin { nested: true, .. }));
    assert_eq!(crud.status(), Status::InternalError);
    crud.close().unwrap();
    assert!(emails(&session).is_empty());
}

#[test]
fn test_root_commit_failure_raises_and_rolls_back() {
    let (session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    session.fail_next(Fault::Commit);
    let err = crud.close().unwrap_err();
    assert!(err.is_resource());
    assert!(!session.in_transaction());
    assert!(emails(&session).is_empty());
}

#[test]
fn test_autobegun_transaction_policies() {
    // a read outside any scope lets the session start a transaction lazily
    let (session, manager) = setup(Config::default());
    session.get(&users(), &RowKey::generate()).unwrap();
    assert_eq!(session.transaction_origin(), Some(TxnOrigin::Autobegin));
    assert!(matches!(
        manager.crud("users"),
        Err(TransactionError::ExistingTransaction { .. })
    ));
    session.rollback().unwrap();

    let config = Config::new().existing_txn_policy(ExistingTxnPolicy::AdoptAutobegin);
    let (session, manager) = setup(config);
    session.get(&users(), &RowKey::generate()).unwrap();
    let mut crud = manager.crud("users").unwrap();
    assert_eq!(
        crud.scope().state().unwrap().origin,
        RootOrigin::Adopted(TxnOrigin::Autobegin)
    );
    crud.add(json!({"email": "a@x.com"})).unwrap();
    crud.close().unwrap();
    assert_eq!(emails(&session), vec!["a@x.com"]);
    assert_eq!(session.journal().last(), Some(&SessionEvent::Commit));

    // explicit transactions are only adopted under the permissive policy
    session.begin().unwrap();
    assert!(manager.crud("users").is_err());
    session.rollback().unwrap();

    let (session, manager) = setup(Config::new().existing_txn_policy(ExistingTxnPolicy::Adopt));
    session.begin().unwrap();
    let crud = manager.crud("users").unwrap();
    crud.close().unwrap();
    assert!(!session.in_transaction());
}

#[test]
fn test_independent_scope_inside_root() {
    let (session, manager) = setup(Config::default());
    let mut outer = manager.crud("users").unwrap();
    outer.add(json!({"email": "a@x.com"})).unwrap();

    let audit = manager.transaction().join(false).label("audit");
    let result: TransactionResult<()> = audit.run(|| {
        manager.with_crud("users", |crud| crud.add(json!({"email": "b@x.com"})).map(|_| ()))?;
        Err(TransactionError::Internal("audit failed".into()))
    });
    assert!(result.is_err());
    assert!(!outer.scope().state().unwrap().error);

    outer.close().unwrap();
    assert_eq!(emails(&session), vec!["a@x.com"]);
}

#[test]
fn test_pagination_through_crud() {
    let (_session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    let items = (0..25).map(|i| json!({"email": format!("{:02}@x.com", i)})).collect();
    crud.add_all(items).unwrap();

    let page = crud
        .query()
        .order_by("email")
        .paginate(crudtx::crud::PageRequest::new(3, 10))
        .unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.total, Some(25));
    assert_eq!(page.items[0].get_str("email"), Some("20@x.com"));
    assert!(!page.has_next);
    crud.close().unwrap();
}

#[test]
fn test_savepoint_release_failure_rolls_back_root() {
    for policy in [ErrorPolicy::Raise, ErrorPolicy::Swallow] {
        let (session, manager) = setup(Config::new().error_policy(policy));
        let mut outer = manager.crud("users").unwrap();
        outer.add(json!({"email": "a@x.com"})).unwrap();

        let mut inner = manager.crud("users").unwrap();
        inner.add(json!({"email": "b@x.com"})).unwrap();
        session.fail_next(Fault::ReleaseSavepoint);
        let closed = inner.close();
        match policy {
            ErrorPolicy::Raise => assert!(closed.unwrap_err().is_resource()),
            ErrorPolicy::Swallow => closed.unwrap(),
        }
        assert!(outer.scope().state().unwrap().error);

        outer.close().unwrap();
        assert!(emails(&session).is_empty());
        assert_eq!(session.journal().last(), Some(&SessionEvent::Rollback));
        assert_eq!(count(&session, SessionEvent::Commit), 0);
    }
}

#[test]
fn test_swallowed_failure_inside_independent_function_stays_there() {
    let (session, manager) = setup(Config::default());
    let mut outer = manager.crud("users").unwrap();
    outer.add(json!({"email": "keep@x.com"})).unwrap();

    let audit = manager.transaction().join(false).error_policy(ErrorPolicy::Swallow);
    let result: TransactionResult<()> = audit.run(|| {
        manager.with_crud("users", |crud| {
            crud.add(json!({"email": "audit@x.com"}))?;
            // duplicate of the caller's row
            assert_eq!(crud.add(json!({"email": "keep@x.com"}))?, None);
            assert_eq!(crud.status(), Status::ResourceError);
            Ok::<_, TransactionError>(())
        })
    });
    result.unwrap();
    assert!(!outer.scope().state().unwrap().error);

    outer.close().unwrap();
    assert_eq!(emails(&session), vec!["keep@x.com"]);
    assert_eq!(session.journal().last(), Some(&SessionEvent::Commit));
}

#[test]
fn test_failed_discard_still_keeps_changes_out() {
    let (session, manager) = setup(Config::default());
    let mut outer = manager.crud("users").unwrap();
    outer.add(json!({"email": "a@x.com"})).unwrap();

    let mut inner = manager.crud("users").unwrap();
    inner.add(json!({"email": "b@x.com"})).unwrap();
    session.fail_next(Fault::RollbackSavepoint);
    assert!(inner.discard().is_failed());
    assert!(outer.scope().state().unwrap().error);
    inner.close().unwrap();

    outer.close().unwrap();
    assert!(emails(&session).is_empty());
}

#[test]
fn test_root_rollback_failure_is_reported() {
    let (session, manager) = setup(Config::default());
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    session.fail_next(Fault::Rollback);
    let err = crud.abort().unwrap_err();
    assert!(err.is_resource());
    assert!(!session.in_transaction());
    assert!(emails(&session).is_empty());
    assert_eq!(manager.active_count(), 0);

    // swallowed, but still logged and the session is left clean
    let (session, manager) = setup(Config::new().error_policy(ErrorPolicy::Swallow));
    let mut crud = manager.crud("users").unwrap();
    crud.add(json!({"email": "a@x.com"})).unwrap();
    session.fail_next(Fault::Rollback);
    crud.abort().unwrap();
    assert!(!session.in_transaction());
    manager.crud("users").unwrap().close().unwrap();
}
