//! Transaction manager - entry point for opening scopes.
//!
//! The TransactionManager is built once from a session provider and a
//! [`Config`] and handed (by clone) to everything that opens scopes.
//! It handles:
//! - Resolving the session a new scope runs on
//! - Tracking per-session transaction state
//! - The ambient error-policy stack of running transactional functions

use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::crud::Crud;
use crate::session::{Session, SessionId};
use crate::transaction::decorator::Transactional;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::policy::{self, ErrorPolicy, PolicyStack};
use crate::transaction::scope::{ScopeGuard, ScopeOptions};
use crate::transaction::state::{StateRegistry, TransactionState};

/// Produces the session the next scope should run on.
pub type SessionProvider = Box<dyn Fn() -> Arc<dyn Session> + Send + Sync>;

/// Transaction manager - coordinates scopes over sessions.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    provider: SessionProvider,
    config: Config,
    /// Transaction state tracked by session identity.
    registry: StateRegistry,
    policies: PolicyStack,
}

impl TransactionManager {
    /// Create a manager that asks `provider` for a session on every scope entry.
    pub fn configure<F>(provider: F, config: Config) -> Self
    where
        F: Fn() -> Arc<dyn Session> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TransactionManagerInner {
                provider: Box::new(provider),
                config,
                registry: StateRegistry::new(),
                policies: PolicyStack::new(),
            }),
        }
    }

    /// Create a manager bound to a single session.
    pub fn for_session(session: Arc<dyn Session>, config: Config) -> Self {
        Self::configure(move || Arc::clone(&session), config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The session a scope opened now would use.
    pub fn session(&self) -> Arc<dyn Session> {
        (self.inner.provider)()
    }

    pub(crate) fn registry(&self) -> &StateRegistry {
        &self.inner.registry
    }

    pub(crate) fn policies(&self) -> &PolicyStack {
        &self.inner.policies
    }

    /// Open a scope with default options.
    pub fn scope(&self) -> TransactionResult<ScopeGuard> {
        self.scope_with(ScopeOptions::default())
    }

    pub fn scope_with(&self, options: ScopeOptions) -> TransactionResult<ScopeGuard> {
        ScopeGuard::enter(self.clone(), options)
    }

    /// Execute a function within a scope, exiting it according to the result.
    ///
    /// If the function returns Ok, the scope exits normally.
    /// If the function returns Err, the scope exits as failed and the
    /// function's error is returned.
    pub fn with_scope<F, T, E>(&self, options: ScopeOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ScopeGuard) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut guard = self.scope_with(options)?;
        match f(&mut guard) {
            Ok(value) => {
                guard.exit(false)?;
                Ok(value)
            }
            Err(e) => {
                let label = guard.label().to_string();
                if let Err(exit_err) = guard.exit(true) {
                    tracing::error!(
                        scope = %label,
                        error = %exit_err,
                        "failed to exit scope after error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Open a CRUD scope on `model`.
    pub fn crud(&self, model: &str) -> TransactionResult<Crud> {
        Crud::open(self, model, Value::Null)
    }

    /// Open a CRUD scope whose fields default to (and queries filter by)
    /// `defaults`, a JSON object.
    pub fn crud_with(&self, model: &str, defaults: Value) -> TransactionResult<Crud> {
        Crud::open(self, model, defaults)
    }

    /// Run `f` with a CRUD scope that is closed (or aborted) afterwards.
    pub fn with_crud<F, T, E>(&self, model: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Crud) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut crud = self.crud(model)?;
        match f(&mut crud) {
            Ok(value) => {
                crud.close()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(exit_err) = crud.abort() {
                    tracing::error!(model, error = %exit_err, "failed to exit scope after error");
                }
                Err(e)
            }
        }
    }

    /// Builder for a function-level transactional wrapper.
    pub fn transaction(&self) -> Transactional {
        Transactional::new(self.clone())
    }

    /// Shared state of a session, if a scope is open on it.
    pub fn state(&self, session: SessionId) -> Option<TransactionState> {
        self.inner.registry.get(session)
    }

    /// Number of sessions with an open scope.
    pub fn active_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Policy pushed by the innermost running transactional function.
    pub fn current_error_policy(&self) -> Option<ErrorPolicy> {
        self.inner.policies.current()
    }

    /// Resolve the effective policy for a scope configured with `instance`.
    pub fn resolve_error_policy(&self, instance: Option<ErrorPolicy>) -> ErrorPolicy {
        policy::resolve(
            self.current_error_policy(),
            instance,
            self.inner.config.error_policy,
        )
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.inner.config)
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySession, SessionEvent, TxnOrigin};

    fn setup() -> (Arc<MemorySession>, TransactionManager) {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(session.clone(), Config::default());
        (session, manager)
    }

    #[test]
    fn test_with_scope_commits() {
        let (session, manager) = setup();
        let result: TransactionResult<u32> = manager.with_scope(ScopeOptions::new(), |_| Ok(7));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            session.journal(),
            vec![SessionEvent::Begin(TxnOrigin::Explicit), SessionEvent::Commit]
        );
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_with_scope_rolls_back_on_error() {
        let (session, manager) = setup();
        let result: TransactionResult<()> = manager.with_scope(ScopeOptions::new(), |_| {
            Err(TransactionError::Internal("test error".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(session.journal().last(), Some(&SessionEvent::Rollback));
    }

    #[test]
    fn test_sequential_scopes_start_clean() {
        let (session, manager) = setup();
        for _ in 0..3 {
            let guard = manager.scope().unwrap();
            assert!(!guard.joined());
            assert_eq!(guard.state().unwrap().depth, 1);
            guard.close().unwrap();
        }
        assert!(manager.state(session.id()).is_none());
    }

    #[test]
    fn test_provider_sessions_are_independent() {
        let a: Arc<dyn Session> = Arc::new(MemorySession::new());
        let b: Arc<dyn Session> = Arc::new(MemorySession::new());
        let ma = TransactionManager::for_session(a.clone(), Config::default());
        let mb = TransactionManager::for_session(b.clone(), Config::default());

        let ga = ma.scope().unwrap();
        let gb = mb.scope().unwrap();
        assert!(!ga.joined());
        assert!(!gb.joined());
        ga.close().unwrap();
        gb.close().unwrap();
    }

    #[test]
    fn test_resolve_uses_config_default() {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(
            session,
            Config::new().error_policy(ErrorPolicy::Swallow),
        );
        assert_eq!(manager.resolve_error_policy(None), ErrorPolicy::Swallow);
        assert_eq!(
            manager.resolve_error_policy(Some(ErrorPolicy::Raise)),
            ErrorPolicy::Raise
        );
        let _frame = manager.policies().push(ErrorPolicy::Swallow);
        assert_eq!(
            manager.resolve_error_policy(Some(ErrorPolicy::Raise)),
            ErrorPolicy::Swallow
        );
    }
}
