//! REPL error types.

use thiserror::Error;

use crate::model::ModelError;
use crate::session::SessionError;
use crate::transaction::TransactionError;

/// Errors surfaced by the interactive shell.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Malformed command line.
    #[error("usage: {0}")]
    Usage(String),

    #[error("no scope is open (use `open <model>`)")]
    NoScope,
}

pub type ReplResult<T> = Result<T, ReplError>;
