use std::sync::Arc;

use crate::data::Record;

/// Identifier for one addressable period of data (typically a calendar year).
/// Examples: `2023`, `2024`, `2025`
pub type PeriodId = String;
/// Monotonically assigned identifier for one background task.
/// Never reused while the task is pending.
pub type TaskId = u64;
/// Coarse cache-invalidation token stamped on every persisted entry.
/// Example: `20260806-gz1`
pub type VersionToken = String;
/// Composite key under which a period dataset is persisted.
/// Example: `periodData-2024`
pub type CacheKey = String;
/// Warning/log message text.
/// Example: `cache write failed; evicting aged entries and retrying`
pub type LogMessage = String;
/// Progress callback invoked with a fraction in `[0, 1]` and a short message.
pub type ProgressSink = Arc<dyn Fn(f64, &str) + Send + Sync>;
/// Per-record transform applied during chunk processing.
pub type RecordTransform = Arc<dyn Fn(&Record) -> Record + Send + Sync>;
/// Predicate selecting records for the filtered view.
pub type RecordFilter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
