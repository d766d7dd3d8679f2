//! Transaction error types.

use thiserror::Error;

use crate::crud::Status;
use crate::model::ModelError;
use crate::session::{SessionError, SessionId, TxnOrigin};
use crate::transaction::policy::ExistingTxnPolicy;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Coarse classification used to decide rollback and propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A root or nested transaction could not be started. Always fatal.
    Begin,
    /// The session rejected an operation. Propagation follows the error policy.
    Resource,
    /// A programming error on the caller's side. Always propagates.
    Internal,
    /// The caller discarded the scope.
    Cancelled,
}

/// Errors that can occur while running transactional scopes.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// `begin()` or `begin_nested()` failed on the session.
    #[error("could not begin {} on session {session}: {source}", begin_target(.nested))]
    Begin {
        session: SessionId,
        nested: bool,
        #[source]
        source: SessionError,
    },

    /// A root scope found an unmanaged transaction it may not adopt.
    #[error("session {session} already has an {origin} transaction (existing-transaction policy: {policy})")]
    ExistingTransaction {
        session: SessionId,
        origin: TxnOrigin,
        policy: ExistingTxnPolicy,
    },

    /// Resource layer error.
    #[error("resource error: {0}")]
    Resource(#[from] SessionError),

    /// Field name not declared on the model.
    #[error("model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sentinel recorded by an explicit discard.
    #[error("scope discarded by caller")]
    Discarded,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn begin_target(nested: &bool) -> &'static str {
    if *nested {
        "savepoint"
    } else {
        "transaction"
    }
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Begin { .. } | TransactionError::ExistingTransaction { .. } => {
                ErrorKind::Begin
            }
            TransactionError::Resource(_) => ErrorKind::Resource,
            TransactionError::Discarded => ErrorKind::Cancelled,
            TransactionError::UnknownField { .. }
            | TransactionError::InvalidArgument(_)
            | TransactionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error may be swallowed under the swallow policy.
    pub fn is_resource(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }

    /// Status a CRUD operation reports when it fails with this error.
    pub fn status(&self) -> Status {
        match self.kind() {
            ErrorKind::Resource | ErrorKind::Cancelled => Status::ResourceError,
            ErrorKind::Begin | ErrorKind::Internal => Status::InternalError,
        }
    }

    pub(crate) fn begin(session: SessionId, source: SessionError) -> Self {
        Self::Begin {
            session,
            nested: false,
            source,
        }
    }

    pub(crate) fn begin_nested(session: SessionId, source: SessionError) -> Self {
        Self::Begin {
            session,
            nested: true,
            source,
        }
    }
}

impl From<ModelError> for TransactionError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnknownColumn { model, column } => TransactionError::UnknownField {
                model,
                field: column,
            },
            other => TransactionError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let session = SessionId::generate();
        let begin = TransactionError::begin(session, SessionError::Operational("down".into()));
        assert_eq!(begin.kind(), ErrorKind::Begin);
        assert_eq!(begin.status(), Status::InternalError);
        assert!(begin.to_string().starts_with("could not begin transaction"));

        let nested =
            TransactionError::begin_nested(session, SessionError::NoActiveTransaction);
        assert!(nested.to_string().starts_with("could not begin savepoint"));

        let resource = TransactionError::from(SessionError::NoResultFound);
        assert!(resource.is_resource());
        assert_eq!(resource.status(), Status::ResourceError);

        assert_eq!(TransactionError::Discarded.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_model_error_conversion() {
        let err = TransactionError::from(ModelError::UnknownColumn {
            model: "users".into(),
            column: "emial".into(),
        });
        assert!(
            matches!(err, TransactionError::UnknownField { ref field, .. } if field == "emial")
        );
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = TransactionError::from(ModelError::InvalidValue("x".into()));
        assert!(matches!(err, TransactionError::InvalidArgument(_)));
    }
}
