//! Transactional scopes for crudtx.
//!
//! Many call sites can each open what looks like a local transaction. Scopes
//! opened on the same session while another is open share one root
//! transaction: the first scope in begins it, every scope bumps a depth
//! counter, and the last one out commits or rolls back. Writes inside a
//! scope go into a savepoint so one failed operation can be undone without
//! touching its siblings, while a sticky error flag guarantees the root is
//! never committed after any scope failed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │   (session provider, config, state registry, policy stack)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ ScopeGuard  │       │ Transaction │       │ Transactional│
//!  │ (+Savepoint)│       │    State    │       │ (decorator) │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use crudtx::transaction::{TransactionManager, ErrorPolicy};
//!
//! let manager = TransactionManager::for_session(session, Config::default());
//!
//! // one scope per call, with nested scopes joining it
//! let signup = manager.transaction().error_policy(ErrorPolicy::Raise);
//! signup.run(|| {
//!     manager.with_crud("users", |users| users.add(json!({"email": "a@x.com"})))?;
//!     manager.with_crud("audit", |audit| audit.add(json!({"event": "signup"})))?;
//!     Ok::<_, TransactionError>(())
//! })?;
//! ```

mod decorator;
mod error;
mod manager;
mod policy;
mod savepoint;
mod scope;
mod state;

pub use decorator::Transactional;
pub use error::{ErrorKind, TransactionError, TransactionResult};
pub use manager::{SessionProvider, TransactionManager};
pub use policy::{resolve as resolve_error_policy, ErrorPolicy, ExistingTxnPolicy};
pub use savepoint::{Cleanup, Savepoint};
pub use scope::{ScopeGuard, ScopeOptions, ScopePhase};
pub use state::{RootOrigin, TransactionState};
