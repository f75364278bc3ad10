//! Fan-out of one query to every shard.

use crate::config::ScatterGatherConfig;
use crate::error::{Error, Result};
use crate::types::ShardId;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs a per-shard function over `0..shard_count` and collects the results
/// in shard order. Any shard failure fails the whole call.
#[derive(Clone, Default)]
pub struct ScatterGather {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl fmt::Debug for ScatterGather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScatterGather")
            .field(
                "threads",
                &self.pool.as_ref().map(|p| p.current_num_threads()),
            )
            .finish()
    }
}

impl ScatterGather {
    /// Shards queried one after another on the calling thread.
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    /// Build from configuration; a worker pool is created only when
    /// `parallelism > 1`.
    pub fn from_config(config: &ScatterGatherConfig) -> Result<Self> {
        if !config.is_parallel() {
            return Ok(Self::sequential());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .thread_name(|i| format!("scatter-gather-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("scatter-gather pool: {}", e)))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Whether shards are queried concurrently.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Run `per_shard` for every shard and return the results in shard order.
    pub fn run<R, F>(&self, shard_count: u32, per_shard: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(ShardId) -> Result<R> + Send + Sync,
    {
        debug!(shard_count, parallel = self.is_parallel(), "Scatter-gather started");

        let results: Vec<Result<R>> = match &self.pool {
            Some(pool) => pool.install(|| (0..shard_count).into_par_iter().map(&per_shard).collect()),
            None => {
                let mut results = Vec::with_capacity(shard_count as usize);
                for shard_id in 0..shard_count {
                    let result = per_shard(shard_id);
                    let failed = result.is_err();
                    results.push(result);
                    if failed {
                        break;
                    }
                }
                results
            }
        };

        let mut gathered = Vec::with_capacity(results.len());
        for (shard_id, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => gathered.push(value),
                Err(source) => {
                    warn!(shard_id, shard_count, error = %source, "Scatter-gather aborted");
                    return Err(Error::ScatterGather {
                        shard_id: shard_id as ShardId,
                        shard_count,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(gathered)
    }

    /// [`run`](Self::run), flattening per-shard lists into one list.
    pub fn gather<R, F>(&self, shard_count: u32, per_shard: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(ShardId) -> Result<Vec<R>> + Send + Sync,
    {
        Ok(self
            .run(shard_count, per_shard)?
            .into_iter()
            .flatten()
            .collect())
    }
}
