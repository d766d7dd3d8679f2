//! The resource contract the transaction layer drives.

use crate::model::ModelSchema;
use crate::session::error::SessionResult;
use crate::session::record::Record;
use crate::session::select::Select;
use crate::session::types::{RowKey, SavepointId, SessionId, TableName, TxnOrigin};

/// A unit-of-work session over some store.
///
/// Implementations must autobegin: any data operation issued while no
/// transaction is open starts one with origin [`TxnOrigin::Autobegin`].
/// `commit` and `rollback` with nothing open are no-ops.
///
/// All methods take `&self`; sessions are shared between scopes through
/// `Arc<dyn Session>` and guard their own state.
pub trait Session: Send + Sync {
    /// Stable identity used to key transaction state.
    fn id(&self) -> SessionId;

    /// Start an explicit root transaction.
    ///
    /// Fails with `TransactionAlreadyBegun` if one is already open.
    fn begin(&self) -> SessionResult<()>;

    /// Open a savepoint inside the current transaction.
    fn begin_nested(&self) -> SessionResult<SavepointId>;

    /// Commit the root transaction, discarding any open savepoints into it.
    fn commit(&self) -> SessionResult<()>;

    /// Roll back the root transaction and every savepoint in it.
    fn rollback(&self) -> SessionResult<()>;

    /// Release a savepoint, keeping its changes in the enclosing level.
    ///
    /// Savepoints opened after `id` are released with it.
    fn release_savepoint(&self, id: SavepointId) -> SessionResult<()>;

    /// Undo everything since `id` was opened and close it.
    fn rollback_to_savepoint(&self, id: SavepointId) -> SessionResult<()>;

    fn savepoint_is_active(&self, id: SavepointId) -> bool;

    /// Origin of the open root transaction, if any.
    fn transaction_origin(&self) -> Option<TxnOrigin>;

    fn in_transaction(&self) -> bool {
        self.transaction_origin().is_some()
    }

    fn schema(&self, table: &TableName) -> SessionResult<ModelSchema>;

    /// Fetch one record by primary key.
    fn get(&self, table: &TableName, key: &RowKey) -> SessionResult<Option<Record>>;

    /// Insert or overwrite by primary key, returning the managed copy.
    fn merge(&self, table: &TableName, record: Record) -> SessionResult<Record>;

    /// Insert several records as one statement; nothing is written on failure.
    fn add_all(&self, table: &TableName, records: Vec<Record>) -> SessionResult<Vec<Record>>;

    fn delete(&self, table: &TableName, key: &RowKey) -> SessionResult<()>;

    fn select(&self, query: &Select) -> SessionResult<Vec<Record>>;
}
