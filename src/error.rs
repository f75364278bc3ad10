//! Error types for shard routing and transactional execution.

use crate::types::ShardId;
use thiserror::Error;

/// Result type alias for sharded operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for calls into a persistence engine.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid topology, entity metadata or settings. Raised at construction.
    #[error("config error: {0}")]
    Config(String),

    /// The routing key was empty or otherwise unusable.
    #[error("invalid routing key: {0:?}")]
    InvalidRoutingKey(String),

    /// No resources are registered for the shard.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Errors surfaced by the persistence engine.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A managed transaction failed and was rolled back.
    #[error("{operation} failed on shard {shard_id}")]
    Transaction {
        operation: &'static str,
        shard_id: ShardId,
        #[source]
        source: Box<Error>,
    },

    /// One shard of a fan-out failed, so the whole fan-out failed.
    #[error("scatter-gather aborted at shard {shard_id} of {shard_count}")]
    ScatterGather {
        shard_id: ShardId,
        shard_count: u32,
        #[source]
        source: Box<Error>,
    },

    /// A locked context was executed more than once.
    #[error("locked context already executed")]
    ContextConsumed,

    /// A locked context chain stopped early; its transaction was rolled back.
    #[error("locked context aborted: {0}")]
    ContextAborted(String),

    /// An observer returned without invoking the rest of the chain.
    #[error("observer {0} did not invoke the next stage")]
    ObserverSkipped(String),

    /// Error raised by caller-supplied logic.
    #[error("application error: {0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an arbitrary caller error.
    pub fn application(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Application(err.into())
    }

    /// The innermost error of the cause chain.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    /// Whether a no-wait row lock could not be acquired somewhere in the chain.
    pub fn is_lock_conflict(&self) -> bool {
        self.find_store_error()
            .map(|e| matches!(e, StoreError::LockConflict { .. }))
            .unwrap_or(false)
    }

    /// First persistence engine error in the cause chain, if any.
    pub fn find_store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Store(e) => Some(e),
            Error::Transaction { source, .. } | Error::ScatterGather { source, .. } => {
                source.find_store_error()
            }
            _ => None,
        }
    }
}

/// Errors raised by a persistence engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot open transactions right now.
    #[error("store {0} unavailable")]
    Unavailable(String),

    /// A write was attempted in a read-only transaction.
    #[error("write attempted in read-only transaction")]
    ReadOnly,

    /// A row is locked by another transaction and the caller asked not to wait.
    #[error("row {table}/{key} is locked by another transaction")]
    LockConflict { table: &'static str, key: String },

    /// A row with the same key already exists.
    #[error("duplicate key {table}/{key}")]
    DuplicateKey { table: &'static str, key: String },

    /// The row to update does not exist.
    #[error("missing row {table}/{key}")]
    MissingRow { table: &'static str, key: String },

    /// A unique lookup matched more than one row.
    #[error("expected a unique result from {table}, found {found}")]
    NonUniqueResult { table: &'static str, found: usize },

    /// No bulk update operation is registered under the name.
    #[error("unknown update operation: {0}")]
    UnknownOperation(String),

    /// Entity could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transaction has already been committed or rolled back.
    #[error("transaction already closed")]
    TransactionClosed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_walks_chain() {
        let err = Error::Transaction {
            operation: "save",
            shard_id: 3,
            source: Box::new(Error::Store(StoreError::ReadOnly)),
        };

        assert_eq!(err.to_string(), "save failed on shard 3");
        assert_eq!(err.root_cause().to_string(), StoreError::ReadOnly.to_string());
    }

    #[test]
    fn test_lock_conflict_detection() {
        let conflict = StoreError::LockConflict {
            table: "orders",
            key: "1".into(),
        };
        let err = Error::ScatterGather {
            shard_id: 0,
            shard_count: 2,
            source: Box::new(Error::Transaction {
                operation: "lock",
                shard_id: 0,
                source: Box::new(conflict.into()),
            }),
        };

        assert!(err.is_lock_conflict());
        assert!(!Error::ContextConsumed.is_lock_conflict());
    }
}
