//! Routing key to shard mapping.

use super::bucket::BucketIdExtractor;
use super::manager::ShardManager;
use crate::error::{Error, Result};
use crate::types::ShardId;
use std::sync::Arc;

/// Composes a bucket extractor and a shard manager.
///
/// Immutable after construction and safe to share across threads.
#[derive(Debug, Clone)]
pub struct ShardCalculator {
    manager: Arc<dyn ShardManager>,
    extractor: Arc<dyn BucketIdExtractor>,
}

impl ShardCalculator {
    /// Create a calculator. Both halves must agree on the bucket space.
    pub fn new(
        manager: Arc<dyn ShardManager>,
        extractor: Arc<dyn BucketIdExtractor>,
    ) -> Result<Self> {
        if manager.num_buckets() != extractor.num_buckets() {
            return Err(Error::Config(format!(
                "shard manager covers {} buckets but extractor produces {}",
                manager.num_buckets(),
                extractor.num_buckets()
            )));
        }
        Ok(Self { manager, extractor })
    }

    /// Shard owning the routing key.
    pub fn shard_id(&self, key: &str) -> Result<ShardId> {
        if key.is_empty() {
            return Err(Error::InvalidRoutingKey(key.to_string()));
        }
        Ok(self.manager.shard_for_bucket(self.extractor.bucket_id(key)))
    }

    /// Number of shards.
    pub fn num_shards(&self) -> u32 {
        self.manager.num_shards()
    }

    /// The underlying shard manager.
    pub fn shard_manager(&self) -> &Arc<dyn ShardManager> {
        &self.manager
    }
}
