//! Savepoint handles and explicit cleanup outcomes.

use std::fmt;
use std::sync::Arc;

use crate::session::{SavepointId, Session, SessionError, SessionResult};
use crate::transaction::error::{TransactionError, TransactionResult};

/// Outcome of a rollback performed while cleaning up after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Cleanup {
    /// There was nothing open to roll back.
    NotNeeded,
    RolledBack,
    /// The rollback itself failed. Logged where it happened.
    Failed(SessionError),
}

impl Cleanup {
    pub fn is_failed(&self) -> bool {
        matches!(self, Cleanup::Failed(_))
    }

    pub(crate) fn from_result(result: SessionResult<()>) -> Self {
        match result {
            Ok(()) => Cleanup::RolledBack,
            Err(e) => Cleanup::Failed(e),
        }
    }
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::NotNeeded => write!(f, "not needed"),
            Cleanup::RolledBack => write!(f, "rolled back"),
            Cleanup::Failed(e) => write!(f, "rollback failed: {}", e),
        }
    }
}

/// A savepoint opened by one scope.
///
/// Resolving it only moves its changes into (or out of) the enclosing
/// level; the root transaction's outcome is decided elsewhere.
pub struct Savepoint {
    session: Arc<dyn Session>,
    id: SavepointId,
}

impl Savepoint {
    pub fn begin(session: Arc<dyn Session>) -> TransactionResult<Self> {
        let id = session
            .begin_nested()
            .map_err(|e| TransactionError::begin_nested(session.id(), e))?;
        tracing::debug!(session = %session.id().short(), savepoint = %id, "opened savepoint");
        Ok(Self { session, id })
    }

    pub fn id(&self) -> SavepointId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.session.savepoint_is_active(self.id)
    }

    /// Release the savepoint into the enclosing transaction.
    pub fn commit(&self) -> SessionResult<()> {
        self.session.release_savepoint(self.id)?;
        tracing::debug!(
            session = %self.session.id().short(),
            savepoint = %self.id,
            "released savepoint"
        );
        Ok(())
    }

    /// Roll back to the savepoint if it is still open.
    pub fn rollback(&self) -> Cleanup {
        if !self.is_active() {
            return Cleanup::NotNeeded;
        }
        let cleanup = Cleanup::from_result(self.session.rollback_to_savepoint(self.id));
        match &cleanup {
            Cleanup::Failed(e) => tracing::error!(
                session = %self.session.id().short(),
                savepoint = %self.id,
                error = %e,
                "savepoint rollback failed"
            ),
            _ => tracing::debug!(
                session = %self.session.id().short(),
                savepoint = %self.id,
                "rolled back savepoint"
            ),
        }
        cleanup
    }
}

impl fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Savepoint")
            .field("session", &self.session.id())
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;

    fn session() -> Arc<MemorySession> {
        let session = Arc::new(MemorySession::new());
        session.begin().unwrap();
        session
    }

    #[test]
    fn test_commit_then_rollback_is_not_needed() {
        let session = session();
        let sp = Savepoint::begin(session.clone()).unwrap();
        assert!(sp.is_active());
        sp.commit().unwrap();
        assert!(!sp.is_active());
        assert_eq!(sp.rollback(), Cleanup::NotNeeded);
    }

    #[test]
    fn test_rollback() {
        let session = session();
        let sp = Savepoint::begin(session.clone()).unwrap();
        assert_eq!(sp.rollback(), Cleanup::RolledBack);
        assert!(sp.commit().is_err());
    }

    #[test]
    fn test_begin_without_root_fails() {
        let session = Arc::new(MemorySession::new());
        let err = Savepoint::begin(session).unwrap_err();
        assert!(matches!(err, TransactionError::Begin { nested: true, .. }));
    }
}
