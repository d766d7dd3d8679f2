//! Scope guards: one per opened transactional scope.
//!
//! A guard either begins the session's root transaction or joins the one a
//! surrounding scope already manages. Writes made through the guard go into
//! a savepoint it opens lazily. On exit the savepoint is resolved first; then
//! the shared depth is decremented and, if this guard was the last one out,
//! the root is committed or rolled back.
//!
//! An independent guard (`join: false` inside an ambient root) is also an
//! error boundary: failures of scopes opened inside it roll back its own
//! savepoint and never reach the root.
//!
//! ```text
//!            enter                  exit(ok)
//!  (none) ──────────▶ Entered ──┬─────────────────────────▶ Committed
//!                               │  exit(failed) / discard
//!                               └─────────────────────────▶ RolledBack
//! ```

use std::sync::Arc;

use crate::session::{Session, SessionId};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::manager::TransactionManager;
use crate::transaction::policy::ErrorPolicy;
use crate::transaction::savepoint::{Cleanup, Savepoint};
use crate::transaction::state::TransactionState;

/// Options for opening a scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    /// Name used in log lines (the model for CRUD scopes).
    pub label: Option<String>,
    /// Join an ambient root (true) or run independently inside its own
    /// savepoint (false). `None` uses the configured default.
    pub join: Option<bool>,
    /// Scope-level error policy.
    pub error_policy: Option<ErrorPolicy>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn join(mut self, join: bool) -> Self {
        self.join = Some(join);
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }
}

/// Where a guard is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    Entered,
    Committed,
    RolledBack,
}

/// An open transactional scope.
///
/// Close it with [`ScopeGuard::exit`]. A guard dropped while still entered
/// exits as failed, which is what an early `?` return out of a scope needs.
pub struct ScopeGuard {
    manager: TransactionManager,
    session: Arc<dyn Session>,
    label: String,
    joined: bool,
    /// runs inside its own savepoint and keeps failures to itself
    independent: bool,
    error_policy: Option<ErrorPolicy>,
    savepoint: Option<Savepoint>,
    needs_commit: bool,
    explicitly_committed: bool,
    discarded: bool,
    error: Option<TransactionError>,
    phase: ScopePhase,
}

impl ScopeGuard {
    pub(crate) fn enter(
        manager: TransactionManager,
        options: ScopeOptions,
    ) -> TransactionResult<Self> {
        let session = manager.session();
        let id = session.id();
        let registry = manager.registry();
        let join = options.join.unwrap_or(manager.config().join);

        let joined = match registry.get(id).filter(|s| s.active) {
            Some(_) => true,
            None => {
                let policy = manager.config().existing_txn_policy;
                registry.get_or_create(session.as_ref(), policy)?;
                false
            }
        };
        let independent = joined && !join;
        let depth = registry.enter(id);

        let savepoint = if independent {
            match Savepoint::begin(Arc::clone(&session)) {
                Ok(sp) => {
                    registry.push_boundary(id);
                    Some(sp)
                }
                Err(e) => {
                    registry.leave(id);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let label = options.label.unwrap_or_else(|| "scope".to_string());
        tracing::debug!(
            session = %id.short(),
            scope = %label,
            depth,
            joined,
            independent,
            "entered scope"
        );

        Ok(Self {
            manager,
            session,
            label,
            joined,
            independent,
            error_policy: options.error_policy,
            savepoint,
            needs_commit: false,
            explicitly_committed: false,
            discarded: false,
            error: None,
            phase: ScopePhase::Entered,
        })
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True if this guard attached to a root another scope manages.
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn independent(&self) -> bool {
        self.independent
    }

    pub fn needs_commit(&self) -> bool {
        self.needs_commit
    }

    pub fn explicitly_committed(&self) -> bool {
        self.explicitly_committed
    }

    pub fn discarded(&self) -> bool {
        self.discarded
    }

    /// The error recorded on this scope, if any.
    pub fn error(&self) -> Option<&TransactionError> {
        self.error.as_ref()
    }

    pub fn phase(&self) -> ScopePhase {
        self.phase
    }

    /// Current shared state of the session this guard is on.
    pub fn state(&self) -> Option<TransactionState> {
        self.manager.registry().get(self.session.id())
    }

    /// Scope-level policy, as set at entry or by [`ScopeGuard::set_error_policy`].
    pub fn configured_error_policy(&self) -> Option<ErrorPolicy> {
        self.error_policy
    }

    pub fn set_error_policy(&mut self, policy: ErrorPolicy) {
        self.error_policy = Some(policy);
    }

    /// Effective policy: ambient transactional function, then this scope,
    /// then the manager default.
    pub fn error_policy(&self) -> ErrorPolicy {
        self.manager.resolve_error_policy(self.error_policy)
    }

    fn ensure_entered(&self) -> TransactionResult<()> {
        match self.phase {
            ScopePhase::Entered => Ok(()),
            _ => Err(TransactionError::Internal(format!(
                "scope '{}' has already exited",
                self.label
            ))),
        }
    }

    fn active_savepoint(&self) -> Option<&Savepoint> {
        self.savepoint.as_ref().filter(|sp| sp.is_active())
    }

    /// Owns the root and no other scope is open on it.
    fn sole_owner(&self) -> bool {
        !self.joined && self.manager.registry().depth(self.session.id()) == 1
    }

    /// Prepare for a write: make sure a savepoint is open and mark the
    /// scope as having pending changes.
    pub fn mark_dirty(&mut self) -> TransactionResult<()> {
        self.ensure_entered()?;
        if self.active_savepoint().is_none() {
            // an explicit root commit closed the transaction
            if !self.session.in_transaction() {
                self.session
                    .begin()
                    .map_err(|e| TransactionError::begin(self.session.id(), e))?;
            }
            self.savepoint = Some(Savepoint::begin(Arc::clone(&self.session))?);
        }
        self.needs_commit = true;
        self.explicitly_committed = false;
        Ok(())
    }

    /// Record a failed operation.
    ///
    /// Resource errors roll back this scope's savepoint, clear pending
    /// changes and flag the innermost error boundary (the root when no
    /// independent scope is open). Other errors are only recorded.
    pub fn record_error(&mut self, error: TransactionError) -> Cleanup {
        let cleanup = if error.is_resource() {
            self.manager.registry().flag_error(self.session.id());
            self.needs_commit = false;
            tracing::warn!(
                session = %self.session.id().short(),
                scope = %self.label,
                error = %error,
                "operation failed, rolling back scope changes"
            );
            match &self.savepoint {
                Some(sp) => sp.rollback(),
                None => Cleanup::NotNeeded,
            }
        } else {
            Cleanup::NotNeeded
        };
        self.error = Some(error);
        cleanup
    }

    /// Resolve pending changes now instead of at exit.
    ///
    /// Releases the open savepoint; with none open, commits the root if
    /// this guard owns it alone. A failed commit is rolled back, logged and
    /// returned according to the error policy.
    pub fn commit(&mut self) -> TransactionResult<()> {
        self.ensure_entered()?;
        let id = self.session.id();

        let (result, root) = match self.active_savepoint() {
            Some(sp) => (sp.commit(), false),
            None if self.sole_owner() => (self.session.commit(), true),
            None => (Ok(()), false),
        };

        match result {
            Ok(()) => {
                self.explicitly_committed = true;
                self.needs_commit = false;
                tracing::debug!(
                    session = %id.short(),
                    scope = %self.label,
                    root,
                    "explicit commit"
                );
                Ok(())
            }
            Err(e) => {
                let cleanup = match (&self.savepoint, root) {
                    (_, true) => Cleanup::from_result(self.session.rollback()),
                    (Some(sp), false) => sp.rollback(),
                    (None, false) => Cleanup::NotNeeded,
                };
                tracing::error!(
                    session = %id.short(),
                    scope = %self.label,
                    error = %e,
                    %cleanup,
                    "explicit commit failed"
                );
                let error = TransactionError::Resource(e);
                self.manager.registry().flag_error(id);
                self.needs_commit = false;
                self.error = Some(error.clone());
                if self.error_policy().raises() {
                    Err(error)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Throw away this scope's pending changes.
    ///
    /// Rolls back the open savepoint, or the root if this guard owns it
    /// alone. Exit will not commit anything afterwards.
    pub fn discard(&mut self) -> Cleanup {
        let cleanup = match self.active_savepoint() {
            Some(sp) => sp.rollback(),
            None if self.phase == ScopePhase::Entered && self.sole_owner() => {
                Cleanup::from_result(self.session.rollback())
            }
            None => Cleanup::NotNeeded,
        };
        tracing::debug!(
            session = %self.session.id().short(),
            scope = %self.label,
            %cleanup,
            "discarded"
        );
        if cleanup.is_failed() {
            // the changes are still in the enclosing level
            self.manager.registry().flag_error(self.session.id());
        }
        self.discarded = true;
        self.needs_commit = false;
        if self.error.is_none() {
            self.error = Some(TransactionError::Discarded);
        }
        cleanup
    }

    /// Leave the scope.
    ///
    /// `failed` reports whether the code run inside the scope failed. The
    /// returned error, if any, comes from resolving the transaction itself
    /// and is subject to the error policy.
    pub fn exit(mut self, failed: bool) -> TransactionResult<()> {
        self.finish(failed)
    }

    /// Leave the scope after a successful body.
    pub fn close(self) -> TransactionResult<()> {
        self.exit(false)
    }

    fn finish(&mut self, failed: bool) -> TransactionResult<()> {
        if self.phase != ScopePhase::Entered {
            return Ok(());
        }
        let id = self.session.id();
        let registry = self.manager.registry();
        let policy = self.error_policy();

        // from here on, flags go to the enclosing boundary
        let inner_failed = self.independent && registry.pop_boundary(id);
        if failed && !self.independent {
            registry.flag_error(id);
        }
        let should_rollback = failed || inner_failed || self.discarded || self.error.is_some();
        let mut outcome = Ok(());

        if should_rollback {
            let errored = self
                .error
                .as_ref()
                .is_some_and(|e| !matches!(e, TransactionError::Discarded));
            if failed || inner_failed || errored {
                tracing::warn!(
                    session = %id.short(),
                    scope = %self.label,
                    failed,
                    inner_failed,
                    error = ?self.error.as_ref().map(|e| e.to_string()),
                    "scope failed"
                );
            }
            if let Some(Cleanup::Failed(e)) = self.savepoint.as_ref().map(Savepoint::rollback) {
                // the changes are still in the enclosing level
                registry.flag_error(id);
                outcome = Err(TransactionError::Resource(e));
            }
            self.needs_commit = false;
        } else if let Some(sp) = self.active_savepoint() {
            if self.independent || (self.needs_commit && !self.explicitly_committed) {
                if let Err(e) = sp.commit() {
                    let cleanup = sp.rollback();
                    tracing::error!(
                        session = %id.short(),
                        scope = %self.label,
                        error = %e,
                        %cleanup,
                        "savepoint commit failed"
                    );
                    if !self.independent || cleanup.is_failed() {
                        registry.flag_error(id);
                    }
                    outcome = Err(TransactionError::Resource(e));
                }
            }
        }

        self.phase = if should_rollback || outcome.is_err() {
            ScopePhase::RolledBack
        } else {
            ScopePhase::Committed
        };

        let Some(state) = registry.leave(id) else {
            return gate(outcome, policy);
        };
        tracing::debug!(
            session = %id.short(),
            scope = %self.label,
            depth = state.depth,
            "left scope"
        );
        if state.depth > 0 {
            return gate(outcome, policy);
        }

        // last one out finalizes the root
        let rollback_root = state.error || should_rollback || outcome.is_err();
        if self.session.in_transaction() {
            if rollback_root {
                let cleanup = Cleanup::from_result(self.session.rollback());
                match &cleanup {
                    Cleanup::Failed(e) => {
                        tracing::error!(session = %id.short(), error = %e, "root rollback failed");
                        if outcome.is_ok() {
                            outcome = Err(TransactionError::Resource(e.clone()));
                        }
                    }
                    _ => tracing::debug!(session = %id.short(), "rolled back root transaction"),
                }
            } else if let Err(e) = self.session.commit() {
                let cleanup = Cleanup::from_result(self.session.rollback());
                tracing::error!(
                    session = %id.short(),
                    error = %e,
                    %cleanup,
                    "root commit failed"
                );
                self.phase = ScopePhase::RolledBack;
                outcome = Err(TransactionError::Resource(e));
            } else {
                tracing::debug!(session = %id.short(), "committed root transaction");
            }
        }
        registry.discard(id);
        gate(outcome, policy)
    }
}

/// Apply the error policy to a failure that came out of resolving the
/// transaction. Swallowed failures have already been logged.
fn gate(outcome: TransactionResult<()>, policy: ErrorPolicy) -> TransactionResult<()> {
    match outcome {
        Err(e) if e.is_resource() && !policy.raises() => Ok(()),
        other => other,
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.phase == ScopePhase::Entered {
            if let Err(e) = self.finish(true) {
                tracing::error!(scope = %self.label, error = %e, "scope dropped without exit");
            }
        }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("session", &self.session.id())
            .field("label", &self.label)
            .field("joined", &self.joined)
            .field("independent", &self.independent)
            .field("savepoint", &self.savepoint)
            .field("needs_commit", &self.needs_commit)
            .field("explicitly_committed", &self.explicitly_committed)
            .field("discarded", &self.discarded)
            .field("phase", &self.phase)
            .finish()
    }
}
