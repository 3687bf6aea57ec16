use std::time::Duration;

use crate::constants::{cache, dispatcher, processor, views};

/// Tuning for the durable period cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum entry age before reads treat it as a miss.
    pub max_entry_age: Duration,
    /// Retention window used when evicting under storage pressure.
    pub retention: Duration,
    /// Gzip-compress serialized entries before writing.
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entry_age: Duration::from_secs(cache::MAX_ENTRY_AGE_HOURS as u64 * 3600),
            retention: Duration::from_secs(cache::RETENTION_DAYS as u64 * 24 * 3600),
            compress: true,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Records per processor chunk.
    pub chunk_size: usize,
    /// Chunks processed concurrently per processor batch.
    pub max_concurrent_chunks: usize,
    /// Dataset size above which chunk transforms are offloaded to the worker.
    pub offload_threshold: usize,
    /// How long to wait for the worker readiness announcement.
    pub worker_ready_timeout: Duration,
    /// Per-task timeout before the worker context is torn down.
    pub task_timeout: Duration,
    /// Maximum view snapshot age before re-derivation.
    pub view_max_age: Duration,
    /// Durable cache tuning.
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: processor::DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: processor::MAX_CONCURRENT_CHUNKS,
            offload_threshold: processor::OFFLOAD_THRESHOLD,
            worker_ready_timeout: Duration::from_secs(dispatcher::READY_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(dispatcher::TASK_TIMEOUT_SECS),
            view_max_age: Duration::from_secs(views::MAX_SNAPSHOT_AGE_SECS),
            cache: CacheConfig::default(),
        }
    }
}
