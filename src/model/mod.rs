//! Entity model schemas.
//!
//! A model declares the columns an entity may carry. The session uses it to
//! enforce constraints when rows are written; the CRUD layer uses it to
//! reject undeclared fields before anything reaches the session.

mod schema;
mod types;

pub use schema::{ModelBuilder, ModelError, ModelSchema};
pub use types::{ColumnDef, ColumnViolation, Constraint, DataType};
