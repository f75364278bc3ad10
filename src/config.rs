//! Configuration types for sharded access.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default size of the bucket space between routing keys and shards.
pub const DEFAULT_NUM_BUCKETS: u32 = 1024;

/// Default namespace reported to observers.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Logical name of this set of shards, attached to every observed operation.
    pub namespace: String,

    /// Size of the bucket space. Must be at least the number of shards.
    pub num_buckets: u32,

    /// Fan-out settings.
    pub scatter_gather: ScatterGatherConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            num_buckets: DEFAULT_NUM_BUCKETS,
            scatter_gather: ScatterGatherConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Create a configuration for the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set the bucket space size.
    pub fn with_num_buckets(mut self, num_buckets: u32) -> Self {
        self.num_buckets = num_buckets;
        self
    }

    /// Set scatter-gather configuration.
    pub fn with_scatter_gather(mut self, scatter_gather: ScatterGatherConfig) -> Self {
        self.scatter_gather = scatter_gather;
        self
    }

    /// Set the number of shards queried concurrently during scatter-gather.
    pub fn with_scatter_parallelism(mut self, parallelism: usize) -> Self {
        self.scatter_gather.parallelism = parallelism;
        self
    }

    /// Check the configuration against a topology of `num_shards` shards.
    pub fn validate(&self, num_shards: u32) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }
        if num_shards == 0 {
            return Err(Error::Config("at least one shard is required".into()));
        }
        if self.num_buckets < num_shards {
            return Err(Error::Config(format!(
                "num_buckets ({}) must be >= number of shards ({})",
                self.num_buckets, num_shards
            )));
        }
        self.scatter_gather.validate()
    }
}

/// Scatter-gather configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterGatherConfig {
    /// Shards queried at once. `1` queries shards one after another on the
    /// calling thread; larger values use a bounded worker pool.
    pub parallelism: usize,
}

impl Default for ScatterGatherConfig {
    fn default() -> Self {
        Self { parallelism: 1 }
    }
}

impl ScatterGatherConfig {
    /// Sequential fan-out on the calling thread.
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Bounded parallel fan-out.
    pub fn parallel(parallelism: usize) -> Self {
        Self { parallelism }
    }

    /// Whether a worker pool is needed.
    pub fn is_parallel(&self) -> bool {
        self.parallelism > 1
    }

    fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Config("scatter-gather parallelism must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShardingConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.num_buckets, 1024);
        assert!(!config.scatter_gather.is_parallel());
        assert!(config.validate(16).is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ShardingConfig::new("orders")
            .with_num_buckets(64)
            .with_scatter_parallelism(4);

        assert_eq!(config.namespace, "orders");
        assert_eq!(config.num_buckets, 64);
        assert!(config.scatter_gather.is_parallel());
    }

    #[test]
    fn test_validate_rejects_bad_topology() {
        let config = ShardingConfig::default().with_num_buckets(4);
        assert!(matches!(config.validate(8), Err(Error::Config(_))));
        assert!(matches!(config.validate(0), Err(Error::Config(_))));

        let config = ShardingConfig::default().with_scatter_parallelism(0);
        assert!(matches!(config.validate(2), Err(Error::Config(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ShardingConfig =
            serde_json::from_str(r#"{"namespace":"billing","scatter_gather":{"parallelism":3}}"#)
                .unwrap();

        assert_eq!(config.namespace, "billing");
        assert_eq!(config.num_buckets, DEFAULT_NUM_BUCKETS);
        assert_eq!(config.scatter_gather, ScatterGatherConfig::parallel(3));
    }
}
