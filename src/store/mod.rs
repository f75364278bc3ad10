//! Boundary with the persistence engine.
//!
//! The engine itself (connections, query execution, storage) lives outside
//! this crate. It plugs in through two traits:
//!
//! - [`ShardStore`]: a transactional resource for one shard or one replica.
//! - [`Session`]: an open transaction on a store.
//!
//! Entities describe themselves through [`Entity`]. [`MemoryStore`] is an
//! in-process engine implementing the boundary.

mod memory;

pub use memory::{MemorySession, MemoryStore};

use crate::error::StoreResult;
use crate::types::{Criteria, UpdateOperationMeta};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A persistent entity type.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique identifier type.
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;

    /// Table (or collection) the entity is stored in.
    const TABLE: &'static str;

    /// Names of the fields designated as the unique identifier.
    ///
    /// Exactly one is required; anything else is rejected when a DAO is built.
    fn key_fields() -> &'static [&'static str];

    /// The identifier of this instance.
    fn key(&self) -> Self::Key;
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// No writes allowed.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

impl TransactionMode {
    /// Whether writes are rejected.
    pub fn is_read_only(self) -> bool {
        self == TransactionMode::ReadOnly
    }
}

/// A transactional resource.
pub trait ShardStore: Send + Sync + 'static {
    /// Open transaction type.
    type Session: Session;

    /// Open a new transaction.
    fn begin(&self, mode: TransactionMode) -> StoreResult<Self::Session>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// An open transaction.
///
/// Dropping a session without committing discards its writes.
pub trait Session: Send {
    /// Look up an entity by key.
    fn get<T: Entity>(&mut self, key: &T::Key) -> StoreResult<Option<T>>;

    /// Select the unique row matching `criteria` and lock it for update
    /// without waiting. Fails with `LockConflict` if another transaction
    /// holds the lock.
    fn lock_for_write<T: Entity>(&mut self, criteria: &Criteria<T>) -> StoreResult<Option<T>>;

    /// Persist a new entity.
    fn save<T: Entity>(&mut self, entity: T) -> StoreResult<T>;

    /// Replace a previously loaded entity. `old` is detached first.
    fn update<T: Entity>(&mut self, old: &T, new: T) -> StoreResult<()>;

    /// A page of rows matching `criteria`, in the engine's natural order.
    fn select<T: Entity>(
        &mut self,
        criteria: &Criteria<T>,
        start: usize,
        num_rows: usize,
    ) -> StoreResult<Vec<T>>;

    /// Number of rows matching `criteria`.
    fn count<T: Entity>(&mut self, criteria: &Criteria<T>) -> StoreResult<u64>;

    /// Run a named bulk update. Returns the number of rows changed.
    fn execute_update(&mut self, operation: &UpdateOperationMeta) -> StoreResult<usize>;

    /// Make all writes durable and release locks.
    fn commit(self) -> StoreResult<()>;

    /// Discard all writes and release locks.
    fn rollback(self) -> StoreResult<()>;
}
