//! crudtx - nested transaction scopes over an ORM-style session
//!
//! Independent call sites each open what looks like a local transaction.
//! Scopes opened on the same session while another one is open share a
//! single root transaction: it is begun once, committed once by the last
//! scope out, and rolled back if any scope along the way failed. Writes go
//! through savepoints, so a failed operation is undone without touching the
//! work of its siblings.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crudtx::config::Config;
//! use crudtx::model::{ColumnDef, DataType, ModelSchema};
//! use crudtx::session::{MemorySession, TableName};
//! use crudtx::transaction::TransactionManager;
//! use serde_json::json;
//!
//! let session = Arc::new(MemorySession::new());
//! let users = ModelSchema::builder(TableName::new("users").unwrap())
//!     .column_def(ColumnDef::new("email", DataType::Text).required().unique())
//!     .build()
//!     .unwrap();
//! session.create_table(users).unwrap();
//!
//! let manager = TransactionManager::for_session(session, Config::default());
//! let mut crud = manager.crud("users").unwrap();
//! crud.add(json!({"email": "a@x.com"})).unwrap();
//! crud.close().unwrap();
//! ```

pub mod config;
pub mod crud;
pub mod db;
pub mod model;
pub mod session;
pub mod transaction;
