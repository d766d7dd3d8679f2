//! Per-session transaction state and its registry.
//!
//! One [`TransactionState`] exists per session while at least one scope is
//! open on it. The first scope in creates it (beginning or adopting the root
//! transaction), every scope bumps `depth`, and the last one out finalizes
//! the root and discards the entry.
//!
//! Independent scopes push an error boundary. While one is open, failures
//! flag the innermost boundary instead of the root, so they end at that
//! scope's savepoint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::session::{Session, SessionId, TxnOrigin};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::policy::ExistingTxnPolicy;

/// How the root transaction of a state came under management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOrigin {
    /// The first scope called `begin()`.
    Began,
    /// The session already had a transaction open and it was adopted.
    Adopted(TxnOrigin),
}

/// Shared bookkeeping for all scopes on one session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionState {
    /// A root transaction is under management.
    pub active: bool,
    /// Number of open scopes sharing the root.
    pub depth: usize,
    /// Sticky: once set, the root is rolled back at finalization.
    pub error: bool,
    /// Error flags of the open independent scopes, innermost last.
    pub boundaries: Vec<bool>,
    pub origin: RootOrigin,
    pub started_at: DateTime<Utc>,
}

impl TransactionState {
    fn new(origin: RootOrigin) -> Self {
        Self {
            active: true,
            depth: 0,
            error: false,
            boundaries: Vec::new(),
            origin,
            started_at: Utc::now(),
        }
    }
}

/// Session identity to state map.
#[derive(Debug, Default)]
pub(crate) struct StateRegistry {
    states: RwLock<HashMap<SessionId, TransactionState>>,
}

impl StateRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Non-creating lookup.
    pub(crate) fn get(&self, session: SessionId) -> Option<TransactionState> {
        self.states.read().get(&session).cloned()
    }

    /// Return the active state for `session`, taking control of a root
    /// transaction first if there is none.
    ///
    /// Nothing is registered when beginning (or adopting) fails.
    pub(crate) fn get_or_create(
        &self,
        session: &dyn Session,
        policy: ExistingTxnPolicy,
    ) -> TransactionResult<TransactionState> {
        let id = session.id();
        if let Some(state) = self.get(id).filter(|s| s.active) {
            return Ok(state);
        }

        let origin = match session.transaction_origin() {
            Some(origin) if policy.adopts(origin) => {
                tracing::debug!(
                    session = %id.short(),
                    %origin,
                    "adopting open transaction as root"
                );
                RootOrigin::Adopted(origin)
            }
            Some(origin) => {
                return Err(TransactionError::ExistingTransaction {
                    session: id,
                    origin,
                    policy,
                });
            }
            None => {
                session
                    .begin()
                    .map_err(|e| TransactionError::begin(id, e))?;
                tracing::debug!(session = %id.short(), "began root transaction");
                RootOrigin::Began
            }
        };

        let state = TransactionState::new(origin);
        self.states.write().insert(id, state.clone());
        Ok(state)
    }

    /// Register one more scope on the root. Returns the new depth.
    pub(crate) fn enter(&self, session: SessionId) -> usize {
        let mut states = self.states.write();
        match states.get_mut(&session) {
            Some(state) => {
                state.depth += 1;
                state.depth
            }
            None => 0,
        }
    }

    /// Flag the innermost error boundary, or the root if there is none.
    pub(crate) fn flag_error(&self, session: SessionId) {
        if let Some(state) = self.states.write().get_mut(&session) {
            match state.boundaries.last_mut() {
                Some(flag) => *flag = true,
                None => state.error = true,
            }
        }
    }

    pub(crate) fn push_boundary(&self, session: SessionId) {
        if let Some(state) = self.states.write().get_mut(&session) {
            state.boundaries.push(false);
        }
    }

    /// Close the innermost boundary. Returns whether anything inside it
    /// failed.
    pub(crate) fn pop_boundary(&self, session: SessionId) -> bool {
        self.states
            .write()
            .get_mut(&session)
            .and_then(|s| s.boundaries.pop())
            .unwrap_or(false)
    }

    pub(crate) fn depth(&self, session: SessionId) -> usize {
        self.states.read().get(&session).map_or(0, |s| s.depth)
    }

    /// Unregister one scope and return the state as it is afterwards.
    pub(crate) fn leave(&self, session: SessionId) -> Option<TransactionState> {
        let mut states = self.states.write();
        let state = states.get_mut(&session)?;
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.active = false;
        }
        Some(state.clone())
    }

    pub(crate) fn discard(&self, session: SessionId) -> Option<TransactionState> {
        self.states.write().remove(&session)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.states.read().values().filter(|s| s.active).count()
    }
}
