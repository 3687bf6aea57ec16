#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Durable versioned cache for parsed period datasets.
pub mod cache;
/// Pipeline and cache configuration types.
pub mod config;
/// Centralized constants used across cache, dispatcher, processor, and retrieval.
pub mod constants;
/// Record and period-dataset types plus payload parsing.
pub mod data;
/// Background task dispatcher with synchronous fallback.
pub mod dispatcher;
/// Per-period load orchestration and merge coordination.
pub mod loader;
/// Period-share metrics over the canonical dataset.
pub mod metrics;
/// Chunked, order-preserving record processing.
pub mod processor;
/// Network and in-memory period retrieval.
pub mod retrieval;
/// Canonical dataset store and mutation notification surface.
pub mod store;
/// Task kinds, payloads, and their shared implementations.
pub mod tasks;
/// Shared type aliases.
pub mod types;
/// Version stamps, compression sniffing, and gzip helpers.
pub mod utils;
/// Lazy base/filtered dataset views.
pub mod views;

mod errors;

pub use cache::PeriodCache;
pub use config::{CacheConfig, PipelineConfig};
pub use data::{PeriodDataset, Record, parse_period_payload, passthrough_transform};
pub use dispatcher::{DispatcherStats, TaskDispatcher};
pub use errors::IngestError;
pub use loader::{LoadPipeline, PeriodLoadStats};
pub use metrics::{PeriodShare, PeriodSkew, period_skew};
pub use processor::{ChunkedProcessor, YieldPoint};
pub use retrieval::{Catalog, HttpPeriodFetcher, InMemoryPeriodFetcher, PeriodFetcher};
pub use store::DatasetStore;
pub use tasks::{TaskKind, TaskOutcome, TaskPayload};
pub use types::{
    CacheKey, LogMessage, PeriodId, ProgressSink, RecordFilter, RecordTransform, TaskId,
    VersionToken,
};
pub use views::{ViewManager, ViewSnapshot};
