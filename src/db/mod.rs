//! Interactive shell for driving scopes by hand.
//!
//! The shell owns a [`MemorySession`](crate::session::MemorySession) and a
//! manager over it, and keeps a stack of open CRUD scopes so nesting,
//! savepoints and failure propagation can be watched step by step.

mod error;
mod repl;

pub use error::{ReplError, ReplResult};
pub use repl::{Outcome, Repl, ReplConfig};
