//! Sharded data access objects.
//!
//! [`ShardedDatabase`] owns the topology (stores per shard, routing and
//! observers) and hands out one [`RelationalDao`] per entity type:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use shardline::{Criteria, Entity, MemoryStore, ShardedDatabase, ShardingConfig};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Order {
//!     id: u64,
//!     customer: String,
//! }
//!
//! impl Entity for Order {
//!     type Key = u64;
//!     const TABLE: &'static str = "orders";
//!
//!     fn key_fields() -> &'static [&'static str] {
//!         &["id"]
//!     }
//!
//!     fn key(&self) -> u64 {
//!         self.id
//!     }
//! }
//!
//! let stores = (0..4).map(|i| MemoryStore::new(format!("shard-{}", i))).collect();
//! let db = ShardedDatabase::with_single_stores(ShardingConfig::default(), stores).unwrap();
//! let orders = db.relational_dao::<Order>().unwrap();
//!
//! orders.save("alice", Order { id: 1, customer: "alice".into() }).unwrap();
//! assert!(orders.exists("alice", &1).unwrap());
//!
//! let all = orders.scatter_gather(&Criteria::all(), 0, 100).unwrap();
//! assert_eq!(all.len(), 1);
//! ```

mod locked;
mod relational;
mod scatter;

pub use locked::{ContextState, LockedContext};
pub use relational::RelationalDao;
pub use scatter::ScatterGather;

use crate::config::ShardingConfig;
use crate::error::{Error, Result};
use crate::execution::{ObserverChain, TracingObserver, TransactionObserver};
use crate::partitioning::{
    BalancedShardManager, ConsistentHashBucketIdExtractor, ShardCalculator, ShardManager,
};
use crate::registry::ResourceHolder;
use crate::store::{Entity, ShardStore};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A set of shards plus everything needed to route and observe operations
/// against them.
pub struct ShardedDatabase<S: ShardStore> {
    config: ShardingConfig,
    holder: Arc<ResourceHolder<S>>,
    calculator: Arc<ShardCalculator>,
    observers: ObserverChain,
    scatter: ScatterGather,
}

impl<S: ShardStore> fmt::Debug for ShardedDatabase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedDatabase")
            .field("namespace", &self.config.namespace)
            .field("shards", &self.holder.shard_count())
            .field("observers", &self.observers.len())
            .field("scatter", &self.scatter)
            .finish()
    }
}

impl<S: ShardStore> ShardedDatabase<S> {
    /// Build from per-shard store lists; shard `i` gets `replicas[i]`.
    ///
    /// The stores of one shard must serve the same data: keyed operations
    /// pick a store by routing key, while shard-wide reads (scatter-gather)
    /// use the first one. Routing uses a balanced shard manager over
    /// `config.num_buckets` buckets. A [`TracingObserver`] is registered first.
    pub fn new(config: ShardingConfig, replicas: Vec<Vec<S>>) -> Result<Self> {
        config.validate(replicas.len() as u32)?;
        let manager = BalancedShardManager::with_buckets(replicas.len() as u32, config.num_buckets)?;
        Self::with_shard_manager(config, replicas, Arc::new(manager))
    }

    /// Build with one store per shard.
    pub fn with_single_stores(config: ShardingConfig, stores: Vec<S>) -> Result<Self> {
        Self::new(config, stores.into_iter().map(|store| vec![store]).collect())
    }

    /// Build with a custom shard manager. It must cover exactly the stores
    /// given and `config.num_buckets` buckets.
    pub fn with_shard_manager(
        config: ShardingConfig,
        replicas: Vec<Vec<S>>,
        manager: Arc<dyn ShardManager>,
    ) -> Result<Self> {
        let num_shards = replicas.len() as u32;
        config.validate(num_shards)?;
        if manager.num_shards() != num_shards {
            return Err(Error::Config(format!(
                "shard manager expects {} shards but {} were given",
                manager.num_shards(),
                num_shards
            )));
        }

        let extractor = ConsistentHashBucketIdExtractor::new(config.num_buckets)?;
        let calculator = ShardCalculator::new(manager, Arc::new(extractor))?;
        let holder = ResourceHolder::from_replicas(replicas)?;
        let scatter = ScatterGather::from_config(&config.scatter_gather)?;

        info!(
            namespace = %config.namespace,
            shards = num_shards,
            buckets = config.num_buckets,
            scatter_parallelism = config.scatter_gather.parallelism,
            "Sharded database ready"
        );

        Ok(Self {
            config,
            holder: Arc::new(holder),
            calculator: Arc::new(calculator),
            observers: ObserverChain::new().with(Arc::new(TracingObserver)),
            scatter,
        })
    }

    /// Register an observer. Applies to DAOs created afterwards.
    pub fn add_observer(&mut self, observer: Arc<dyn TransactionObserver>) -> &mut Self {
        self.observers.push(observer);
        self
    }

    /// Replace the observer chain, dropping the default tracing observer.
    pub fn with_observers(mut self, observers: ObserverChain) -> Self {
        self.observers = observers;
        self
    }

    /// A DAO for entity type `T`.
    pub fn relational_dao<T: Entity>(&self) -> Result<RelationalDao<T, S>> {
        RelationalDao::new(
            self.holder.clone(),
            self.calculator.clone(),
            Arc::new(self.observers.clone()),
            self.config.namespace.as_str(),
            self.scatter.clone(),
        )
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn shard_count(&self) -> u32 {
        self.holder.shard_count()
    }

    pub fn calculator(&self) -> &Arc<ShardCalculator> {
        &self.calculator
    }

    pub fn resources(&self) -> &Arc<ResourceHolder<S>> {
        &self.holder
    }
}
