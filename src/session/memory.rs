//! In-process session backed by snapshot copies.
//!
//! The committed state is a map of tables. An open transaction works on a
//! private copy of it; every savepoint pushes a snapshot of that copy.
//! Commit swaps the working copy in, rollback drops it, and rolling back to a
//! savepoint restores its snapshot.
//!
//! Every transaction boundary is appended to a journal so callers can see
//! exactly what the session was asked to do.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde_json::Value;

use crate::model::{ColumnViolation, ModelSchema};
use crate::session::error::{SessionError, SessionResult};
use crate::session::record::Record;
use crate::session::select::{values_equal, Select};
use crate::session::traits::Session;
use crate::session::types::{RowKey, SavepointId, SessionId, TableName, TxnOrigin};

/// A transaction boundary the session performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Begin(TxnOrigin),
    Commit,
    Rollback,
    SavepointBegin(SavepointId),
    SavepointRelease(SavepointId),
    SavepointRollback(SavepointId),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Begin(origin) => write!(f, "BEGIN ({})", origin),
            SessionEvent::Commit => write!(f, "COMMIT"),
            SessionEvent::Rollback => write!(f, "ROLLBACK"),
            SessionEvent::SavepointBegin(id) => write!(f, "SAVEPOINT {}", id),
            SessionEvent::SavepointRelease(id) => write!(f, "RELEASE SAVEPOINT {}", id),
            SessionEvent::SavepointRollback(id) => write!(f, "ROLLBACK TO SAVEPOINT {}", id),
        }
    }
}

/// An operation that can be made to fail once with an operational error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Begin,
    BeginNested,
    Commit,
    /// A failed rollback still ends the transaction, as with a connection
    /// that has to be thrown away.
    Rollback,
    ReleaseSavepoint,
    /// A failed savepoint rollback leaves the savepoint and its changes in
    /// place.
    RollbackSavepoint,
    /// the next merge, add_all or delete
    Write,
}

impl Fault {
    /// Parse a fault name as printed by the shell (`begin`, `nested`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "begin" => Some(Fault::Begin),
            "nested" | "begin_nested" | "savepoint" => Some(Fault::BeginNested),
            "commit" => Some(Fault::Commit),
            "rollback" => Some(Fault::Rollback),
            "release" | "release_savepoint" => Some(Fault::ReleaseSavepoint),
            "rollback_to" | "rollback_savepoint" => Some(Fault::RollbackSavepoint),
            "write" => Some(Fault::Write),
            _ => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Fault::Begin => "begin",
            Fault::BeginNested => "begin_nested",
            Fault::Commit => "commit",
            Fault::Rollback => "rollback",
            Fault::ReleaseSavepoint => "release_savepoint",
            Fault::RollbackSavepoint => "rollback_savepoint",
            Fault::Write => "write",
        }
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: ModelSchema,
    rows: BTreeMap<RowKey, Record>,
}

type Tables = BTreeMap<TableName, Table>;

struct OpenTxn {
    origin: TxnOrigin,
    working: Tables,
    savepoints: Vec<(SavepointId, Tables)>,
}

struct Inner {
    committed: Tables,
    txn: Option<OpenTxn>,
    next_savepoint: u64,
    journal: Vec<SessionEvent>,
    faults: Vec<Fault>,
}

impl Inner {
    /// The open transaction, autobeginning one if needed.
    fn open_txn(&mut self) -> &mut OpenTxn {
        if self.txn.is_none() {
            self.journal.push(SessionEvent::Begin(TxnOrigin::Autobegin));
        }
        let committed = &self.committed;
        self.txn.get_or_insert_with(|| OpenTxn {
            origin: TxnOrigin::Autobegin,
            working: committed.clone(),
            savepoints: Vec::new(),
        })
    }

    fn take_fault(&mut self, fault: Fault) -> SessionResult<()> {
        match self.faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                self.faults.remove(pos);
                Err(SessionError::Operational(format!(
                    "injected {} failure",
                    fault.describe()
                )))
            }
            None => Ok(()),
        }
    }
}

/// A session whose store lives in memory.
pub struct MemorySession {
    id: SessionId,
    inner: Mutex<Inner>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self {
            id: SessionId::generate(),
            inner: Mutex::new(Inner {
                committed: BTreeMap::new(),
                txn: None,
                next_savepoint: 1,
                journal: Vec::new(),
                faults: Vec::new(),
            }),
        }
    }

    /// Declare a model. Takes effect immediately, outside any transaction.
    pub fn create_table(&self, schema: ModelSchema) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        if inner.committed.contains_key(&schema.name) {
            return Err(SessionError::TableAlreadyExists(schema.name));
        }
        let table = Table {
            schema,
            rows: BTreeMap::new(),
        };
        if let Some(txn) = inner.txn.as_mut() {
            txn.working.insert(table.schema.name.clone(), table.clone());
            for (_, snapshot) in txn.savepoints.iter_mut() {
                snapshot.insert(table.schema.name.clone(), table.clone());
            }
        }
        inner.committed.insert(table.schema.name.clone(), table);
        Ok(())
    }

    pub fn tables(&self) -> Vec<TableName> {
        self.inner.lock().committed.keys().cloned().collect()
    }

    /// Rows as of the last commit. Never autobegins.
    pub fn committed_rows(&self, table: &TableName) -> SessionResult<Vec<Record>> {
        let inner = self.inner.lock();
        let table = inner
            .committed
            .get(table)
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))?;
        Ok(table.rows.values().cloned().collect())
    }

    /// Number of savepoints currently open.
    pub fn savepoint_depth(&self) -> usize {
        self.inner
            .lock()
            .txn
            .as_ref()
            .map_or(0, |t| t.savepoints.len())
    }

    pub fn journal(&self) -> Vec<SessionEvent> {
        self.inner.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.inner.lock().journal.clear();
    }

    /// Make the next occurrence of `fault` fail with an operational error.
    pub fn fail_next(&self, fault: Fault) {
        self.inner.lock().faults.push(fault);
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply defaults, then check nullability, types and uniqueness.
fn check_row(table: &Table, record: &mut Record) -> SessionResult<()> {
    let schema = &table.schema;
    schema.apply_defaults(&mut record.data);

    if let Some((col, violation)) = schema.first_violation(&record.data) {
        return Err(match violation {
            ColumnViolation::Null => SessionError::NotNullViolation {
                table: schema.name.clone(),
                column: col.name.clone(),
            },
            ColumnViolation::Type { expected, found } => SessionError::TypeMismatch {
                table: schema.name.clone(),
                column: col.name.clone(),
                expected: expected.to_string(),
                found,
            },
        });
    }

    for col in schema.unique_columns() {
        let Some(value) = record.data.get(&col.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = table.rows.values().any(|other| {
            other.key != record.key
                && other
                    .get(&col.name)
                    .is_some_and(|existing| values_equal(existing, value))
        });
        if clash {
            return Err(SessionError::UniqueViolation {
                table: schema.name.clone(),
                column: col.name.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}

fn upsert(table: &mut Table, mut record: Record) -> SessionResult<Record> {
    check_row(table, &mut record)?;
    let stored = match table.rows.get(&record.key) {
        Some(existing) => {
            let mut updated = existing.clone();
            let changes = record
                .data
                .into_iter()
                .filter(|(k, v)| existing.get(k) != Some(v))
                .collect();
            updated.apply(changes);
            updated
        }
        None => record,
    };
    table.rows.insert(stored.key.clone(), stored.clone());
    Ok(stored)
}

impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn begin(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(Fault::Begin)?;
        if let Some(txn) = &inner.txn {
            return Err(SessionError::TransactionAlreadyBegun { origin: txn.origin });
        }
        inner.txn = Some(OpenTxn {
            origin: TxnOrigin::Explicit,
            working: inner.committed.clone(),
            savepoints: Vec::new(),
        });
        inner.journal.push(SessionEvent::Begin(TxnOrigin::Explicit));
        Ok(())
    }

    fn begin_nested(&self) -> SessionResult<SavepointId> {
        let mut inner = self.inner.lock();
        inner.take_fault(Fault::BeginNested)?;
        let id = SavepointId(inner.next_savepoint);
        let txn = inner.txn.as_mut().ok_or(SessionError::NoActiveTransaction)?;
        let snapshot = txn.working.clone();
        txn.savepoints.push((id, snapshot));
        inner.next_savepoint += 1;
        inner.journal.push(SessionEvent::SavepointBegin(id));
        Ok(id)
    }

    fn commit(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        if inner.txn.is_none() {
            return Ok(());
        }
        inner.take_fault(Fault::Commit)?;
        if let Some(txn) = inner.txn.take() {
            inner.committed = txn.working;
        }
        inner.journal.push(SessionEvent::Commit);
        Ok(())
    }

    fn rollback(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        if inner.txn.is_none() {
            return Ok(());
        }
        let result = inner.take_fault(Fault::Rollback);
        inner.txn = None;
        if result.is_ok() {
            inner.journal.push(SessionEvent::Rollback);
        }
        result
    }

    fn release_savepoint(&self, id: SavepointId) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .txn
            .as_ref()
            .and_then(|t| t.savepoints.iter().position(|(sp, _)| *sp == id))
            .ok_or(SessionError::SavepointNotFound(id))?;
        inner.take_fault(Fault::ReleaseSavepoint)?;
        if let Some(txn) = inner.txn.as_mut() {
            txn.savepoints.truncate(pos);
        }
        inner.journal.push(SessionEvent::SavepointRelease(id));
        Ok(())
    }

    fn rollback_to_savepoint(&self, id: SavepointId) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .txn
            .as_ref()
            .and_then(|t| t.savepoints.iter().position(|(sp, _)| *sp == id))
            .ok_or(SessionError::SavepointNotFound(id))?;
        inner.take_fault(Fault::RollbackSavepoint)?;
        let txn = inner.txn.as_mut().ok_or(SessionError::SavepointNotFound(id))?;
        let mut dropped = txn.savepoints.split_off(pos);
        if let Some((_, snapshot)) = dropped.drain(..).next() {
            txn.working = snapshot;
        }
        inner.journal.push(SessionEvent::SavepointRollback(id));
        Ok(())
    }

    fn savepoint_is_active(&self, id: SavepointId) -> bool {
        self.inner
            .lock()
            .txn
            .as_ref()
            .is_some_and(|t| t.savepoints.iter().any(|(sp, _)| *sp == id))
    }

    fn transaction_origin(&self) -> Option<TxnOrigin> {
        self.inner.lock().txn.as_ref().map(|t| t.origin)
    }

    fn schema(&self, table: &TableName) -> SessionResult<ModelSchema> {
        let inner = self.inner.lock();
        inner
            .committed
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))
    }

    fn get(&self, table: &TableName, key: &RowKey) -> SessionResult<Option<Record>> {
        let mut inner = self.inner.lock();
        let txn = inner.open_txn();
        let t = txn
            .working
            .get(table)
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))?;
        Ok(t.rows.get(key).cloned())
    }

    fn merge(&self, table: &TableName, record: Record) -> SessionResult<Record> {
        let mut inner = self.inner.lock();
        inner.take_fault(Fault::Write)?;
        let txn = inner.open_txn();
        let t = txn
            .working
            .get_mut(table)
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))?;
        upsert(t, record)
    }

    fn add_all(&self, table: &TableName, records: Vec<Record>) -> SessionResult<Vec<Record>> {
        let mut inner = self.inner.lock();
        inner.take_fault(Fault::Write)?;
        let txn = inner.open_txn();
        let current = txn
            .working
            .get(table)
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))?;

        let mut staged = current.clone();
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            if staged.rows.contains_key(&record.key) {
                return Err(SessionError::UniqueViolation {
                    table: table.clone(),
                    column: "_pk".to_string(),
                    value: Value::String(record.key.to_string()),
                });
            }
            stored.push(upsert(&mut staged, record)?);
        }
        txn.working.insert(table.clone(), staged);
        Ok(stored)
    }

    fn delete(&self, table: &TableName, key: &RowKey) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(Fault::Write)?;
        let txn = inner.open_txn();
        let t = txn
            .working
            .get_mut(table)
            .ok_or_else(|| SessionError::TableNotFound(table.clone()))?;
        match t.rows.remove(key) {
            Some(_) => Ok(()),
            None => Err(SessionError::RowNotFound {
                table: table.clone(),
                key: key.clone(),
            }),
        }
    }

    fn select(&self, query: &Select) -> SessionResult<Vec<Record>> {
        let mut inner = self.inner.lock();
        let txn = inner.open_txn();
        let rows = txn
            .working
            .get(&query.table)
            .ok_or_else(|| SessionError::TableNotFound(query.table.clone()))?
            .rows
            .values()
            .cloned()
            .collect();
        let joined: Vec<Record> = match &query.join {
            Some(join) => txn
                .working
                .get(&join.table)
                .ok_or_else(|| SessionError::TableNotFound(join.table.clone()))?
                .rows
                .values()
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(query.evaluate(rows, &joined))
    }
}
