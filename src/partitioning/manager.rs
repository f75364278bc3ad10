//! Bucket to shard assignment.
//!
//! A shard manager is built once per topology and never changes afterwards.
//! Rebalancing means building a new manager.

use crate::error::{Error, Result};
use crate::types::{BucketId, ShardId};
use std::fmt::Debug;

/// Maps buckets to shards.
pub trait ShardManager: Send + Sync + Debug {
    /// Number of shards.
    fn num_shards(&self) -> u32;

    /// Size of the bucket space covered by this manager.
    fn num_buckets(&self) -> u32;

    /// Shard owning a bucket. Out of range buckets wrap around the bucket space.
    fn shard_for_bucket(&self, bucket: BucketId) -> ShardId;

    /// Number of buckets owned by each shard, indexed by shard id.
    fn bucket_distribution(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.num_shards() as usize];
        for bucket in 0..self.num_buckets() {
            counts[self.shard_for_bucket(bucket) as usize] += 1;
        }
        counts
    }
}

/// Lookup table shared by the built-in managers.
#[derive(Debug, Clone)]
struct BucketTable {
    owners: Vec<ShardId>,
    num_shards: u32,
}

impl BucketTable {
    /// Lay out `counts[i]` contiguous buckets for each shard `i`.
    fn from_counts(counts: &[u32]) -> Self {
        let mut owners = Vec::with_capacity(counts.iter().map(|&c| c as usize).sum());
        for (shard, &count) in counts.iter().enumerate() {
            owners.extend(std::iter::repeat(shard as ShardId).take(count as usize));
        }
        Self {
            owners,
            num_shards: counts.len() as u32,
        }
    }

    fn lookup(&self, bucket: BucketId) -> ShardId {
        self.owners[bucket as usize % self.owners.len()]
    }
}

/// Spreads buckets over shards as evenly as possible.
///
/// Each shard owns one contiguous bucket range. Range sizes differ by at most
/// one bucket; the first `num_buckets % num_shards` shards take the extra one.
#[derive(Debug, Clone)]
pub struct BalancedShardManager {
    table: BucketTable,
}

impl BalancedShardManager {
    /// Create a manager with the default bucket space.
    pub fn new(num_shards: u32) -> Result<Self> {
        Self::with_buckets(num_shards, crate::config::DEFAULT_NUM_BUCKETS.max(num_shards))
    }

    /// Create a manager over a custom bucket space.
    pub fn with_buckets(num_shards: u32, num_buckets: u32) -> Result<Self> {
        if num_shards == 0 {
            return Err(Error::Config("at least one shard is required".into()));
        }
        if num_buckets < num_shards {
            return Err(Error::Config(format!(
                "cannot spread {} buckets over {} shards",
                num_buckets, num_shards
            )));
        }

        let base = num_buckets / num_shards;
        let extra = num_buckets % num_shards;
        let counts: Vec<u32> = (0..num_shards)
            .map(|shard| base + u32::from(shard < extra))
            .collect();

        Ok(Self {
            table: BucketTable::from_counts(&counts),
        })
    }
}

impl ShardManager for BalancedShardManager {
    fn num_shards(&self) -> u32 {
        self.table.num_shards
    }

    fn num_buckets(&self) -> u32 {
        self.table.owners.len() as u32
    }

    fn shard_for_bucket(&self, bucket: BucketId) -> ShardId {
        self.table.lookup(bucket)
    }
}

/// Spreads buckets proportionally to per-shard weights.
///
/// Uses largest-remainder apportionment, so the result is deterministic and
/// every bucket is assigned. A shard with weight zero owns no buckets.
#[derive(Debug, Clone)]
pub struct WeightedShardManager {
    table: BucketTable,
    weights: Vec<u32>,
}

impl WeightedShardManager {
    /// Create a manager; `weights[i]` is the relative capacity of shard `i`.
    pub fn new(weights: Vec<u32>, num_buckets: u32) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::Config("at least one shard is required".into()));
        }
        let total: u64 = weights.iter().map(|&w| w as u64).sum();
        if total == 0 {
            return Err(Error::Config("shard weights must not all be zero".into()));
        }
        if num_buckets == 0 {
            return Err(Error::Config("bucket space must not be empty".into()));
        }

        let mut counts = Vec::with_capacity(weights.len());
        let mut remainders = Vec::with_capacity(weights.len());
        for (shard, &weight) in weights.iter().enumerate() {
            let exact = weight as u64 * num_buckets as u64;
            counts.push((exact / total) as u32);
            remainders.push((exact % total, shard));
        }

        // Hand leftover buckets to the largest remainders, lowest shard id first on ties
        let assigned: u32 = counts.iter().sum();
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for &(_, shard) in remainders.iter().take((num_buckets - assigned) as usize) {
            counts[shard] += 1;
        }

        Ok(Self {
            table: BucketTable::from_counts(&counts),
            weights,
        })
    }

    /// Configured weights.
    pub fn weights(&self) -> &[u32] {
        &self.weights
    }
}

impl ShardManager for WeightedShardManager {
    fn num_shards(&self) -> u32 {
        self.table.num_shards
    }

    fn num_buckets(&self) -> u32 {
        self.table.owners.len() as u32
    }

    fn shard_for_bucket(&self, bucket: BucketId) -> ShardId {
        self.table.lookup(bucket)
    }
}
