//! In-memory transactional store.
//!
//! Rows are kept as JSON values per table, in insertion order. A session
//! buffers its writes and applies them atomically on commit; rollback or
//! drop discards them. Row locks are no-wait: a conflicting lock request
//! fails immediately instead of queuing.

use super::{Entity, Session, ShardStore, TransactionMode};
use crate::error::{StoreError, StoreResult};
use crate::types::{Criteria, UpdateOperationMeta};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type RowRef = (&'static str, String);

type UpdateFn = dyn Fn(&Value, &UpdateOperationMeta) -> StoreResult<Option<Value>> + Send + Sync;

#[derive(Debug, Clone)]
struct Row {
    key: String,
    value: Value,
}

#[derive(Debug, Default)]
struct Table {
    /// Row id to row. Row ids grow monotonically, giving insertion order.
    rows: BTreeMap<u64, Row>,
    /// Key to row id.
    index: HashMap<String, u64>,
    next_row_id: u64,
}

impl Table {
    fn insert(&mut self, key: String, value: Value) {
        let row_id = self.next_row_id;
        self.next_row_id += 1;
        self.index.insert(key.clone(), row_id);
        self.rows.insert(row_id, Row { key, value });
    }

    fn replace(&mut self, key: &str, value: Value) -> bool {
        match self.index.get(key).and_then(|id| self.rows.get_mut(id)) {
            Some(row) => {
                row.value = value;
                true
            }
            None => false,
        }
    }
}

struct NamedUpdate {
    table: &'static str,
    apply: Arc<UpdateFn>,
}

struct StoreInner {
    name: String,
    tables: RwLock<HashMap<&'static str, Table>>,
    /// Row to owning transaction id.
    locks: Mutex<HashMap<RowRef, u64>>,
    updates: RwLock<HashMap<String, NamedUpdate>>,
    next_txn_id: AtomicU64,
    available: AtomicBool,
}

impl StoreInner {
    fn release_locks(&self, txn_id: u64, held: &mut Vec<RowRef>) {
        if held.is_empty() {
            return;
        }
        let mut locks = self.locks.lock();
        for row in held.drain(..) {
            if locks.get(&row) == Some(&txn_id) {
                locks.remove(&row);
            }
        }
    }
}

/// In-memory transactional store.
///
/// Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                tables: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                updates: RwLock::new(HashMap::new()),
                next_txn_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Register a named bulk update for entity type `T`.
    ///
    /// `op` returns the replacement for rows it applies to and `None` for rows
    /// it leaves alone.
    pub fn register_update<T, F>(&self, name: impl Into<String>, op: F)
    where
        T: Entity,
        F: Fn(&T, &UpdateOperationMeta) -> Option<T> + Send + Sync + 'static,
    {
        let apply = move |value: &Value, meta: &UpdateOperationMeta| -> StoreResult<Option<Value>> {
            let entity: T = serde_json::from_value(value.clone())?;
            match op(&entity, meta) {
                Some(updated) => Ok(Some(serde_json::to_value(updated)?)),
                None => Ok(None),
            }
        };
        self.inner.updates.write().insert(
            name.into(),
            NamedUpdate {
                table: T::TABLE,
                apply: Arc::new(apply),
            },
        );
    }

    /// Make the store refuse (or accept again) new transactions.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.available.store(!unavailable, Ordering::SeqCst);
    }

    /// Number of committed rows in a table.
    pub fn committed_rows(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Number of row locks currently held.
    pub fn held_locks(&self) -> usize {
        self.inner.locks.lock().len()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl ShardStore for MemoryStore {
    type Session = MemorySession;

    fn begin(&self, mode: TransactionMode) -> StoreResult<MemorySession> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(self.inner.name.clone()));
        }
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.inner.name, txn_id, ?mode, "Began transaction");
        Ok(MemorySession {
            store: self.inner.clone(),
            txn_id,
            mode,
            pending: Vec::new(),
            pending_index: HashMap::new(),
            held: Vec::new(),
            closed: false,
        })
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

#[derive(Debug)]
struct PendingWrite {
    table: &'static str,
    key: String,
    value: Value,
    insert: bool,
}

/// An open transaction on a [`MemoryStore`].
pub struct MemorySession {
    store: Arc<StoreInner>,
    txn_id: u64,
    mode: TransactionMode,
    pending: Vec<PendingWrite>,
    pending_index: HashMap<RowRef, usize>,
    held: Vec<RowRef>,
    closed: bool,
}

impl MemorySession {
    /// Transaction id, unique within the store.
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        if self.mode.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Take a row lock. Returns `true` if this call acquired it and `false`
    /// if the transaction already held it.
    fn try_lock(&mut self, table: &'static str, key: &str) -> StoreResult<bool> {
        let row = (table, key.to_string());
        let mut locks = self.store.locks.lock();
        match locks.get(&row) {
            Some(&owner) if owner == self.txn_id => Ok(false),
            Some(_) => Err(StoreError::LockConflict {
                table,
                key: key.to_string(),
            }),
            None => {
                locks.insert(row.clone(), self.txn_id);
                self.held.push(row);
                Ok(true)
            }
        }
    }

    fn unlock(&mut self, table: &'static str, key: &str) {
        let row = (table, key.to_string());
        if let Some(pos) = self.held.iter().position(|held| *held == row) {
            let mut released = vec![self.held.swap_remove(pos)];
            self.store.release_locks(self.txn_id, &mut released);
        }
    }

    /// Current value of a row as seen by this transaction.
    fn lookup(&self, table: &'static str, key: &str) -> Option<Value> {
        if let Some(&idx) = self.pending_index.get(&(table, key.to_string())) {
            return Some(self.pending[idx].value.clone());
        }
        let tables = self.store.tables.read();
        let t = tables.get(table)?;
        t.index
            .get(key)
            .and_then(|id| t.rows.get(id))
            .map(|row| row.value.clone())
    }

    /// All rows of a table as seen by this transaction, in natural order.
    fn view(&self, table: &'static str) -> Vec<(String, Value)> {
        let mut rows = Vec::new();
        {
            let tables = self.store.tables.read();
            if let Some(t) = tables.get(table) {
                for row in t.rows.values() {
                    let value = match self.pending_index.get(&(table, row.key.clone())) {
                        Some(&idx) => self.pending[idx].value.clone(),
                        None => row.value.clone(),
                    };
                    rows.push((row.key.clone(), value));
                }
            }
        }
        rows.extend(
            self.pending
                .iter()
                .filter(|w| w.insert && w.table == table)
                .map(|w| (w.key.clone(), w.value.clone())),
        );
        rows
    }

    fn matching<T: Entity>(&self, criteria: &Criteria<T>) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for (_, value) in self.view(T::TABLE) {
            let entity: T = serde_json::from_value(value)?;
            if criteria.matches(&entity) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    fn write(&mut self, table: &'static str, key: String, value: Value, insert: bool) {
        let row = (table, key.clone());
        match self.pending_index.get(&row) {
            Some(&idx) => self.pending[idx].value = value,
            None => {
                self.pending_index.insert(row, self.pending.len());
                self.pending.push(PendingWrite {
                    table,
                    key,
                    value,
                    insert,
                });
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.pending_index.clear();
        self.store.release_locks(self.txn_id, &mut self.held);
    }
}

impl Session for MemorySession {
    fn get<T: Entity>(&mut self, key: &T::Key) -> StoreResult<Option<T>> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        match self.lookup(T::TABLE, &key.to_string()) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn lock_for_write<T: Entity>(&mut self, criteria: &Criteria<T>) -> StoreResult<Option<T>> {
        self.ensure_writable()?;
        let mut found = self.matching(criteria)?;
        if found.len() > 1 {
            return Err(StoreError::NonUniqueResult {
                table: T::TABLE,
                found: found.len(),
            });
        }
        let key = match found.pop() {
            Some(entity) => entity.key().to_string(),
            None => return Ok(None),
        };
        let acquired = self.try_lock(T::TABLE, &key)?;

        // The row may have been committed by another transaction between the
        // scan and the lock, so hand back what is current under the lock.
        let current = match self.lookup(T::TABLE, &key) {
            Some(value) => Some(serde_json::from_value::<T>(value)?),
            None => None,
        };
        match current {
            Some(entity) if criteria.matches(&entity) => Ok(Some(entity)),
            _ => {
                if acquired {
                    self.unlock(T::TABLE, &key);
                }
                Ok(None)
            }
        }
    }

    fn save<T: Entity>(&mut self, entity: T) -> StoreResult<T> {
        self.ensure_writable()?;
        let key = entity.key().to_string();
        if self.lookup(T::TABLE, &key).is_some() {
            return Err(StoreError::DuplicateKey {
                table: T::TABLE,
                key,
            });
        }
        self.try_lock(T::TABLE, &key)?;
        let value = serde_json::to_value(&entity)?;
        self.write(T::TABLE, key, value, true);
        Ok(entity)
    }

    fn update<T: Entity>(&mut self, old: &T, new: T) -> StoreResult<()> {
        self.ensure_writable()?;
        let key = new.key().to_string();
        if self.lookup(T::TABLE, &key).is_none() {
            return Err(StoreError::MissingRow {
                table: T::TABLE,
                key,
            });
        }
        let old_key = old.key().to_string();
        if old_key != key {
            debug!(table = T::TABLE, %old_key, %key, "Update replaces a different row than loaded");
        }
        self.try_lock(T::TABLE, &key)?;
        let value = serde_json::to_value(&new)?;
        self.write(T::TABLE, key, value, false);
        Ok(())
    }

    fn select<T: Entity>(
        &mut self,
        criteria: &Criteria<T>,
        start: usize,
        num_rows: usize,
    ) -> StoreResult<Vec<T>> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        Ok(self
            .matching(criteria)?
            .into_iter()
            .skip(start)
            .take(num_rows)
            .collect())
    }

    fn count<T: Entity>(&mut self, criteria: &Criteria<T>) -> StoreResult<u64> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        Ok(self.matching(criteria)?.len() as u64)
    }

    fn execute_update(&mut self, operation: &UpdateOperationMeta) -> StoreResult<usize> {
        self.ensure_writable()?;
        let (table, apply) = {
            let updates = self.store.updates.read();
            let named = updates
                .get(&operation.query_name)
                .ok_or_else(|| StoreError::UnknownOperation(operation.query_name.clone()))?;
            (named.table, named.apply.clone())
        };

        let mut changed = Vec::new();
        for (key, value) in self.view(table) {
            if let Some(updated) = apply(&value, operation)? {
                changed.push((key, updated));
            }
        }
        for (key, _) in &changed {
            self.try_lock(table, key)?;
        }

        let count = changed.len();
        for (key, value) in changed {
            self.write(table, key, value, false);
        }
        Ok(count)
    }

    fn commit(mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }

        {
            let mut tables = self.store.tables.write();

            // Validate everything before touching any table so commit is all-or-nothing
            let conflict = self.pending.iter().find_map(|write| {
                let exists = tables
                    .get(write.table)
                    .map(|t| t.index.contains_key(&write.key))
                    .unwrap_or(false);
                let (table, key) = (write.table, write.key.clone());
                match (write.insert, exists) {
                    (true, true) => Some(StoreError::DuplicateKey { table, key }),
                    (false, false) => Some(StoreError::MissingRow { table, key }),
                    _ => None,
                }
            });
            if let Some(err) = conflict {
                drop(tables);
                self.close();
                return Err(err);
            }

            for write in self.pending.drain(..) {
                let table = tables.entry(write.table).or_default();
                if write.insert {
                    table.insert(write.key, write.value);
                } else {
                    table.replace(&write.key, write.value);
                }
            }
        }

        debug!(store = %self.store.name, txn_id = self.txn_id, "Committed transaction");
        self.close();
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        debug!(
            store = %self.store.name,
            txn_id = self.txn_id,
            discarded = self.pending.len(),
            "Rolled back transaction"
        );
        self.close();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}
