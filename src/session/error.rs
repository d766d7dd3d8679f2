//! Session (resource layer) error types
//!
//! Everything the session can reject is a `SessionError`. The transaction
//! layer treats these as recoverable resource failures: they are rolled back
//! locally and their propagation is gated by the error policy.

use serde_json::Value;
use thiserror::Error;

use crate::session::types::{RowKey, SavepointId, TableName, TxnOrigin};

/// the error type for session operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// an operation needed an open transaction and there was none
    #[error("no transaction is active on this session")]
    NoActiveTransaction,

    /// `begin()` while a transaction is already open
    #[error("a transaction is already begun on this session ({origin})")]
    TransactionAlreadyBegun { origin: TxnOrigin },

    /// the savepoint was already released, rolled back, or never existed
    #[error("savepoint {0} is not active")]
    SavepointNotFound(SavepointId),

    /// the model was never declared on this session
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("table already exists: {0}")]
    TableAlreadyExists(TableName),

    #[error("row not found: table={table}, key={key}")]
    RowNotFound { table: TableName, key: RowKey },

    /// UNIQUE constraint failed
    #[error("unique constraint failed: {table}.{column} = {value}")]
    UniqueViolation {
        table: TableName,
        column: String,
        value: Value,
    },

    /// NOT NULL constraint failed
    #[error("not null constraint failed: {table}.{column}")]
    NotNullViolation { table: TableName, column: String },

    #[error("type mismatch on {table}.{column}: expected {expected}, found {found}")]
    TypeMismatch {
        table: TableName,
        column: String,
        expected: String,
        found: Value,
    },

    /// `one()` found nothing
    #[error("no row was found when one was required")]
    NoResultFound,

    /// `one()`/`one_or_none()` found more than one row
    #[error("multiple rows were found when at most one was required ({count})")]
    MultipleResultsFound { count: usize },

    /// the backend failed for reasons outside the data (connectivity, locks)
    #[error("operational error: {0}")]
    Operational(String),
}

impl SessionError {
    /// check if this error is an integrity (constraint) failure
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            SessionError::UniqueViolation { .. }
                | SessionError::NotNullViolation { .. }
                | SessionError::TypeMismatch { .. }
        )
    }

    /// check if this error indicates the target doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SessionError::TableNotFound(_)
                | SessionError::RowNotFound { .. }
                | SessionError::NoResultFound
        )
    }

    /// check if this error is about transaction bookkeeping rather than data
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            SessionError::NoActiveTransaction
                | SessionError::TransactionAlreadyBegun { .. }
                | SessionError::SavepointNotFound(_)
        )
    }
}

/// result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
