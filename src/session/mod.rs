//! Session layer for crudtx
//!
//! A session is the resource the transaction layer drives: it owns the
//! root transaction, savepoints and the data itself. Upper layers only see
//! the [`Session`] trait; [`MemorySession`] is the bundled implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │               dyn Session                 │
//! │  begin / commit / rollback / savepoints   │
//! │  get / merge / add_all / delete / select  │
//! └───────────────────────────────────────────┘
//!                      │
//!        ┌─────────────┴─────────────┐
//!        ▼                           ▼
//!  ┌─────────────┐            ┌─────────────┐
//!  │   Select    │            │   Record    │
//!  │  (queries)  │            │   (rows)    │
//!  └─────────────┘            └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use crudtx::session::{MemorySession, Session, Record, TableName};
//!
//! let session = MemorySession::new();
//! session.create_table(schema)?;
//!
//! // autobegins
//! let users = TableName::new("users")?;
//! let row = session.merge(&users, Record::with_data(fields))?;
//! session.commit()?;
//! ```

mod error;
mod memory;
mod record;
mod select;
mod traits;
mod types;

pub use error::{SessionError, SessionResult};
pub use memory::{Fault, MemorySession, SessionEvent};
pub use record::{fields_from_value, Fields, Record};
pub use select::{values_equal, Filter, FilterOp, Join, OrderBy, Select};
pub use traits::Session;
pub use types::{InvalidNameError, RowKey, SavepointId, SessionId, TableName, TxnOrigin};
