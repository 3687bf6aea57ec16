use thiserror::Error;

use crate::types::{PeriodId, TaskId};

/// Error type for retrieval, decode, task-offload, and cache failures.
///
/// Cloneable so a deduplicated load can hand the same outcome to every
/// caller waiting on it.
#[derive(Clone, Debug, Error)]
pub enum IngestError {
    #[error("period '{period_id}' retrieval failed: {reason}")]
    Retrieval { period_id: PeriodId, reason: String },
    #[error("period '{period_id}' returned a markup document instead of data: {reason}")]
    Format { period_id: PeriodId, reason: String },
    #[error("period '{period_id}' payload could not be parsed: {reason}")]
    Parse { period_id: PeriodId, reason: String },
    #[error("period '{period_id}' payload decompression failed: {reason}")]
    Decompression { period_id: PeriodId, reason: String },
    #[error("task {task_id} timed out after {seconds}s")]
    TaskTimeout { task_id: TaskId, seconds: u64 },
    #[error("background worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("cache store failure: {0}")]
    CacheStore(String),
    #[error("cache write exceeded storage quota: {0}")]
    QuotaExceeded(String),
    #[error("stale cache entry for '{0}'")]
    StaleCache(PeriodId),
    #[error("configuration error: {0}")]
    Configuration(String),
}
