//! Per-shard registry of transactional resources.
//!
//! Each shard owns an ordered list of resource handles (replicas or logical
//! sub-partitions). Keys are spread over a shard's handles with a consistent
//! hash sized to that list, so a key always lands on the same handle for the
//! lifetime of the holder.

use crate::error::{Error, Result};
use crate::partitioning::{BucketIdExtractor, ConsistentHashBucketIdExtractor};
use crate::types::ShardId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resources of one shard.
#[derive(Debug)]
struct ShardResources<S> {
    handles: Vec<Arc<S>>,
    extractor: ConsistentHashBucketIdExtractor,
}

impl<S> ShardResources<S> {
    fn get(&self, key: &str) -> &Arc<S> {
        if self.handles.len() == 1 {
            return &self.handles[0];
        }
        &self.handles[self.extractor.bucket_id(key) as usize]
    }
}

/// Immutable shard to resource mapping.
#[derive(Debug)]
pub struct ResourceHolder<S> {
    shards: Vec<ShardResources<S>>,
}

impl<S> ResourceHolder<S> {
    /// Build from a topology of shard id to handles.
    ///
    /// Shard ids must be exactly `0..n` and every shard needs at least one handle.
    pub fn new(topology: BTreeMap<ShardId, Vec<S>>) -> Result<Self> {
        if topology.is_empty() {
            return Err(Error::Config("topology has no shards".into()));
        }

        let mut shards = Vec::with_capacity(topology.len());
        for (expected, (shard_id, handles)) in topology.into_iter().enumerate() {
            if shard_id as usize != expected {
                return Err(Error::Config(format!(
                    "shard ids must be contiguous from 0, expected {} but found {}",
                    expected, shard_id
                )));
            }
            if handles.is_empty() {
                return Err(Error::Config(format!("shard {} has no resources", shard_id)));
            }
            let extractor = ConsistentHashBucketIdExtractor::new(handles.len() as u32)?;
            shards.push(ShardResources {
                handles: handles.into_iter().map(Arc::new).collect(),
                extractor,
            });
        }

        Ok(Self { shards })
    }

    /// Build with a single handle per shard; shard `i` gets `handles[i]`.
    pub fn from_single(handles: Vec<S>) -> Result<Self> {
        Self::new(
            handles
                .into_iter()
                .enumerate()
                .map(|(shard, handle)| (shard as ShardId, vec![handle]))
                .collect(),
        )
    }

    /// Build from per-shard handle lists; shard `i` gets `replicas[i]`.
    pub fn from_replicas(replicas: Vec<Vec<S>>) -> Result<Self> {
        Self::new(
            replicas
                .into_iter()
                .enumerate()
                .map(|(shard, handles)| (shard as ShardId, handles))
                .collect(),
        )
    }

    /// Handle serving `key` within `shard`.
    pub fn get(&self, shard: ShardId, key: &str) -> Result<&Arc<S>> {
        self.shard(shard).map(|resources| resources.get(key))
    }

    /// First handle of `shard`, for shard-wide operations.
    pub fn get_any(&self, shard: ShardId) -> Result<&Arc<S>> {
        self.shard(shard).map(|resources| &resources.handles[0])
    }

    /// All handles of `shard`.
    pub fn handles(&self, shard: ShardId) -> Result<&[Arc<S>]> {
        self.shard(shard).map(|resources| resources.handles.as_slice())
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    fn shard(&self, shard: ShardId) -> Result<&ShardResources<S>> {
        self.shards
            .get(shard as usize)
            .ok_or(Error::ShardNotFound(shard))
    }
}
