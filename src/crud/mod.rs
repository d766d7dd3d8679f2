//! Caller-facing CRUD surface.
//!
//! A [`Crud`] is a scope bound to one model. Writes go through the scope's
//! savepoint, reads through an explicit [`Query`] interface, and every
//! operation leaves a [`Status`] behind for callers running under the
//! swallow policy.
//!
//! # Usage
//!
//! ```ignore
//! let mut users = manager.crud("users")?;
//! let ann = users.add(json!({"email": "ann@x.com"}))?;
//! let page = users.query().order_by("email").paginate(PageRequest::new(1, 20))?;
//! users.close()?;
//! ```

#[allow(clippy::module_inception)]
mod crud;
mod pagination;
mod query;
mod status;

pub use crud::Crud;
pub use pagination::{Page, PageRequest};
pub use query::Query;
pub use status::Status;
