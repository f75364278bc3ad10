//! Consistent hashing of routing keys into a fixed bucket space.
//!
//! Keys are hashed with xxHash64 over their raw bytes and reduced modulo the
//! bucket count. The hash is seeded with a constant, so bucket assignment is
//! stable across processes and restarts.

use crate::error::{Error, Result};
use crate::types::BucketId;
use std::fmt::Debug;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed for bucket hashing. Changing it remaps every key.
pub const BUCKET_HASH_SEED: u64 = 0x5AFE_CAFE_DEAD_BEEF;

/// Maps a routing key to a bucket.
pub trait BucketIdExtractor: Send + Sync + Debug {
    /// Bucket for a key, always in `[0, num_buckets)`.
    fn bucket_id(&self, key: &str) -> BucketId;

    /// Size of the bucket space.
    fn num_buckets(&self) -> u32;
}

/// Uniform bucket extractor built on xxHash64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentHashBucketIdExtractor {
    num_buckets: u32,
}

impl ConsistentHashBucketIdExtractor {
    /// Create an extractor over `num_buckets` buckets.
    pub fn new(num_buckets: u32) -> Result<Self> {
        if num_buckets == 0 {
            return Err(Error::Config("bucket space must not be empty".into()));
        }
        Ok(Self { num_buckets })
    }

    /// Hash a key with the bucket seed.
    pub fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(BUCKET_HASH_SEED);
        hasher.write(key);
        hasher.finish()
    }
}

impl BucketIdExtractor for ConsistentHashBucketIdExtractor {
    fn bucket_id(&self, key: &str) -> BucketId {
        (Self::hash_key(key.as_bytes()) % self.num_buckets as u64) as BucketId
    }

    fn num_buckets(&self) -> u32 {
        self.num_buckets
    }
}
