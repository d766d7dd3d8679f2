//! Outcome status of CRUD operations.

use std::fmt;

/// Status of the last operation on a CRUD scope.
///
/// Numeric codes are stable and match what callers may persist or log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    /// The session rejected the operation.
    ResourceError,
    /// The operation failed for any other reason.
    InternalError,
    /// The operation matched nothing.
    NotFound,
}

impl Status {
    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::ResourceError => 1,
            Status::InternalError => 2,
            Status::NotFound => 5,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::ResourceError => write!(f, "RESOURCE_ERROR"),
            Status::InternalError => write!(f, "INTERNAL_ERROR"),
            Status::NotFound => write!(f, "NOT_FOUND"),
        }
    }
}
