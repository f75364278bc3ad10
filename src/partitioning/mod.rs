//! Partitioning of routing keys across shards.
//!
//! Routing happens in two steps so shards can be rebalanced without
//! rehashing keys one by one:
//!
//! ```text
//! routing key ──hash──▶ bucket ──ShardManager──▶ shard
//!  "tenant-7"           [0, num_buckets)          [0, num_shards)
//! ```
//!
//! # Example
//!
//! ```rust
//! use shardline::partitioning::{
//!     BalancedShardManager, ConsistentHashBucketIdExtractor, ShardCalculator, ShardManager,
//! };
//! use std::sync::Arc;
//!
//! let manager = BalancedShardManager::new(4).unwrap();
//! let extractor = ConsistentHashBucketIdExtractor::new(manager.num_buckets()).unwrap();
//! let calculator = ShardCalculator::new(Arc::new(manager), Arc::new(extractor)).unwrap();
//!
//! let shard = calculator.shard_id("tenant-7").unwrap();
//! assert!(shard < 4);
//! ```

mod bucket;
mod calculator;
mod manager;

pub use bucket::{BucketIdExtractor, ConsistentHashBucketIdExtractor, BUCKET_HASH_SEED};
pub use calculator::ShardCalculator;
pub use manager::{BalancedShardManager, ShardManager, WeightedShardManager};
