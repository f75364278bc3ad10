//! Shard routing and managed transactional execution over horizontally
//! partitioned stores.
//!
//! This crate sits between an application and a set of independently
//! provisioned database shards:
//! - **Routing**: a routing key is hashed into a fixed bucket space and the
//!   bucket is mapped to a shard, so every entity of a parent lands on the
//!   same shard
//! - **Managed transactions**: every DAO call runs in its own transaction,
//!   committed on success and rolled back on failure
//! - **Locked contexts**: several operations chained into one transaction
//!   that starts by locking (or creating) a row
//! - **Scatter-gather**: administrative fan-out of one query to all shards
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use shardline::{Entity, MemoryStore, ShardedDatabase, ShardingConfig};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Invoice {
//!     id: String,
//!     amount: u64,
//! }
//!
//! impl Entity for Invoice {
//!     type Key = String;
//!     const TABLE: &'static str = "invoices";
//!
//!     fn key_fields() -> &'static [&'static str] {
//!         &["id"]
//!     }
//!
//!     fn key(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! # fn main() -> shardline::Result<()> {
//! let stores = (0..8).map(|i| MemoryStore::new(format!("db-{}", i))).collect();
//! let db = ShardedDatabase::with_single_stores(ShardingConfig::new("billing"), stores)?;
//! let invoices = db.relational_dao::<Invoice>()?;
//!
//! invoices.save("tenant-1", Invoice { id: "inv-1".into(), amount: 40 })?;
//! let updated = invoices.update("tenant-1", &"inv-1".to_string(), |mut invoice| {
//!     invoice.amount += 2;
//!     Some(invoice)
//! })?;
//! assert!(updated);
//! assert_eq!(invoices.get("tenant-1", &"inv-1".to_string())?.map(|i| i.amount), Some(42));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              RelationalDao<T, S>                 │
//! │  get / save / update / select / lock_and_get_…   │
//! └──────────────────────────────────────────────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌──────────────────┐   ┌──────────────────────────┐
//! │ ShardCalculator  │   │   TransactionExecutor    │
//! │ key → bucket →   │   │   observer chain around  │
//! │ shard            │   │   begin/commit/rollback  │
//! └──────────────────┘   └──────────────────────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌──────────────────┐   ┌──────────────────────────┐
//! │  ResourceHolder  │──▶│  ShardStore / Session    │
//! │  shard → stores  │   │  (persistence engine)    │
//! └──────────────────┘   └──────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - Each call is one transaction on one shard; there are no cross-shard
//!   transactions
//! - Locked contexts use no-wait row locks: a contending writer fails
//!   immediately instead of queuing
//! - Scatter-gather is all-or-nothing: one failing shard fails the call

pub mod config;
pub mod dao;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod partitioning;
pub mod registry;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{ScatterGatherConfig, ShardingConfig};
pub use dao::{ContextState, LockedContext, RelationalDao, ScatterGather, ShardedDatabase};
pub use error::{Error, Result, StoreError, StoreResult};
pub use types::{BucketId, Criteria, ParamValue, ShardId, UpdateOperationMeta, UpdateOutcome};

// Re-export routing types
pub use partitioning::{
    BalancedShardManager, BucketIdExtractor, ConsistentHashBucketIdExtractor, ShardCalculator,
    ShardManager, WeightedShardManager,
};
pub use registry::ResourceHolder;

// Re-export persistence boundary types
pub use store::{Entity, MemorySession, MemoryStore, Session, ShardStore, TransactionMode};

// Re-export execution types
pub use execution::{
    ObserverChain, ObserverContext, TracingObserver, TransactionExecutor, TransactionInfo,
    TransactionObserver, TransactionScope, TypeTagObserver,
};
pub use metrics::{MetricsObserver, TransactionMetrics, TransactionMetricsSnapshot};
