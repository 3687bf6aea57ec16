use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::cache::PeriodCache;
use crate::config::PipelineConfig;
use crate::data::{PeriodDataset, Record, passthrough_transform};
use crate::dispatcher::TaskDispatcher;
use crate::errors::IngestError;
use crate::processor::ChunkedProcessor;
use crate::retrieval::{Catalog, PeriodFetcher};
use crate::store::DatasetStore;
use crate::tasks::{TaskKind, TaskOutcome, TaskPayload};
use crate::types::{PeriodId, ProgressSink};

/// Per-period load telemetry.
#[derive(Clone, Debug, Default)]
pub struct PeriodLoadStats {
    /// Duration of the most recent load in milliseconds.
    pub last_load_ms: u128,
    /// Records produced by the most recent load.
    pub last_record_count: usize,
    /// Throughput estimate for the most recent load.
    pub last_records_per_sec: f64,
    /// True when the most recent load was served from the durable cache.
    pub from_cache: bool,
    /// Last load error message, if any.
    pub last_error: Option<String>,
    /// Total failed loads for this period.
    pub error_count: u64,
}

type LoadOutcome = Result<Arc<PeriodDataset>, IngestError>;

/// Shared slot a deduplicated load resolves through.
struct LoadSlot {
    outcome: Mutex<Option<LoadOutcome>>,
    done: Condvar,
}

struct PipelineState {
    loaded: IndexMap<PeriodId, Arc<PeriodDataset>>,
    in_flight: HashMap<PeriodId, Arc<LoadSlot>>,
    stats: HashMap<PeriodId, PeriodLoadStats>,
    catalog_stamp: Option<String>,
}

/// Coordinates cache, dispatcher, processor, and canonical-dataset merge
/// for per-period loads.
///
/// The pipeline is the canonical dataset's only writer. Concurrent loads
/// of the same period are deduplicated through an in-flight table: the
/// second caller waits on the first call's slot and observes its outcome.
pub struct LoadPipeline {
    fetcher: Box<dyn PeriodFetcher>,
    cache: Arc<PeriodCache>,
    dispatcher: Arc<TaskDispatcher>,
    processor: ChunkedProcessor,
    store: DatasetStore,
    progress: Option<ProgressSink>,
    state: Mutex<PipelineState>,
}

impl LoadPipeline {
    /// Wire a pipeline from explicitly constructed parts.
    pub fn new(
        fetcher: Box<dyn PeriodFetcher>,
        cache: Arc<PeriodCache>,
        dispatcher: Arc<TaskDispatcher>,
        processor: ChunkedProcessor,
        store: DatasetStore,
    ) -> Self {
        Self {
            fetcher,
            cache,
            dispatcher,
            processor,
            store,
            progress: None,
            state: Mutex::new(PipelineState {
                loaded: IndexMap::new(),
                in_flight: HashMap::new(),
                stats: HashMap::new(),
                catalog_stamp: None,
            }),
        }
    }

    /// Build the standard wiring: one dispatcher (initialized once), a
    /// dispatcher-backed cache at `cache_path`, and a processor and store
    /// configured from `config`.
    pub fn open(
        fetcher: Box<dyn PeriodFetcher>,
        cache_path: impl Into<PathBuf>,
        config: PipelineConfig,
    ) -> Result<Self, IngestError> {
        let dispatcher = Arc::new(
            TaskDispatcher::new(passthrough_transform())
                .with_timeouts(config.worker_ready_timeout, config.task_timeout),
        );
        dispatcher.init();
        let cache = Arc::new(
            PeriodCache::open(cache_path, config.cache.clone())?
                .with_dispatcher(Arc::clone(&dispatcher)),
        );
        let processor = ChunkedProcessor::new(Arc::clone(&dispatcher))
            .with_chunk_size(config.chunk_size)
            .with_max_concurrent(config.max_concurrent_chunks)
            .with_offload_threshold(config.offload_threshold);
        let store = DatasetStore::with_view_settings(None, config.view_max_age);
        Ok(Self::new(fetcher, cache, dispatcher, processor, store))
    }

    /// Report load progress through this sink.
    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Load one period dataset.
    ///
    /// Resolution order: in-memory result, durable cache, network. A
    /// concurrent call for the same period never starts duplicate work;
    /// the in-flight guard is released on every outcome so a failed
    /// period can be retried.
    pub fn load_period(
        &self,
        period_id: &str,
        force_reload: bool,
    ) -> Result<Arc<PeriodDataset>, IngestError> {
        let slot = {
            let mut state = self.state.lock().expect("pipeline state poisoned");
            if !force_reload
                && let Some(dataset) = state.loaded.get(period_id)
            {
                debug!(period_id, "period already loaded; serving from memory");
                self.report(1.0, &format!("{period_id} already loaded"));
                return Ok(Arc::clone(dataset));
            }
            if let Some(slot) = state.in_flight.get(period_id) {
                let slot = Arc::clone(slot);
                drop(state);
                debug!(period_id, "load already in flight; awaiting its outcome");
                return Self::wait_for_slot(&slot);
            }
            let slot = Arc::new(LoadSlot {
                outcome: Mutex::new(None),
                done: Condvar::new(),
            });
            state.in_flight.insert(period_id.to_string(), Arc::clone(&slot));
            slot
        };

        let started = Instant::now();
        let (outcome, from_cache) = self.perform_load(period_id, force_reload);
        self.finish_load(period_id, &slot, outcome, from_cache, started)
    }

    /// Load several periods in parallel and replace the canonical dataset
    /// with their records concatenated in request order (not completion
    /// order). Invalidates views exactly once. A failed load propagates
    /// and nothing merges.
    pub fn merge_all(
        &self,
        period_ids: &[PeriodId],
        force_reload: bool,
    ) -> Result<usize, IngestError> {
        if period_ids.is_empty() {
            warn!("merge requested with no periods selected");
            return Ok(0);
        }
        let mut results: Vec<Option<LoadOutcome>> = Vec::new();
        results.resize_with(period_ids.len(), || None);
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(period_ids.len());
            for (idx, period_id) in period_ids.iter().enumerate() {
                handles.push((
                    idx,
                    scope.spawn(move || self.load_period(period_id, force_reload)),
                ));
            }
            for (idx, handle) in handles {
                results[idx] = Some(handle.join().unwrap_or_else(|_| {
                    Err(IngestError::WorkerUnavailable(
                        "period load thread panicked".to_string(),
                    ))
                }));
            }
        });

        let mut combined: Vec<Record> = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            let dataset = result.expect("load result recorded")?;
            combined.extend(dataset.records.iter().cloned());
            debug!(
                period_id = %period_ids[idx],
                running_total = combined.len(),
                "period records staged for merge"
            );
        }

        let processed = self.processor.process(combined, self.progress.as_ref())?;
        let merged = processed.len();
        self.store.replace(processed);
        info!(
            periods = period_ids.len(),
            records = merged,
            "canonical dataset replaced"
        );
        Ok(merged)
    }

    /// Load one period and append its transformed records to the canonical
    /// dataset (one view invalidation). Callers track period membership;
    /// appending a period twice duplicates its records.
    pub fn load_and_append(&self, period_id: &str) -> Result<usize, IngestError> {
        let dataset = self.load_period(period_id, false)?;
        let processed = self
            .processor
            .process(dataset.records.clone(), self.progress.as_ref())?;
        let appended = processed.len();
        self.store.append(processed);
        info!(period_id, appended, "period records appended");
        Ok(appended)
    }

    /// Remove a period from memory, the canonical dataset, and the durable
    /// cache. Safe to call twice. Returns the removed record count.
    pub fn remove_period(&self, period_id: &str) -> usize {
        {
            let mut state = self.state.lock().expect("pipeline state poisoned");
            state.loaded.shift_remove(period_id);
        }
        let removed = self.store.remove_period(period_id);
        self.cache.delete(period_id);
        info!(period_id, removed, "period removed");
        removed
    }

    /// Fetch the catalog and decide whether cached periods must be
    /// force-reloaded (the coarse "last updated" stamp moved).
    pub fn refresh_catalog(&self) -> Result<Catalog, IngestError> {
        let mut catalog = self.fetcher.fetch_catalog()?;
        let previous = {
            let state = self.state.lock().expect("pipeline state poisoned");
            state.catalog_stamp.clone()
        }
        .or_else(|| self.cache.load_catalog_stamp());

        catalog.needs_reload = match (&previous, &catalog.last_update) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(old), Some(new)) => old != new,
        };
        if let Some(stamp) = catalog.last_update.clone() {
            self.state
                .lock()
                .expect("pipeline state poisoned")
                .catalog_stamp = Some(stamp.clone());
            self.cache.store_catalog_stamp(&stamp);
        }
        if catalog.needs_reload {
            info!(
                previous = previous.as_deref().unwrap_or("<none>"),
                current = catalog.last_update.as_deref().unwrap_or("<none>"),
                "catalog stamp changed; cached periods will be force-reloaded"
            );
            let mut state = self.state.lock().expect("pipeline state poisoned");
            state.loaded.clear();
        }
        Ok(catalog)
    }

    /// Refresh the catalog and merge every advertised period.
    pub fn sync_all(&self) -> Result<usize, IngestError> {
        let catalog = self.refresh_catalog()?;
        self.merge_all(&catalog.periods, catalog.needs_reload)
    }

    /// The canonical dataset store (read accessor plus notification
    /// surface for consumers).
    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Base view over the canonical dataset.
    pub fn base_view(&self) -> Arc<Vec<Record>> {
        self.store.base_view()
    }

    /// Filtered view over the canonical dataset.
    pub fn filtered_view(&self) -> Arc<Vec<Record>> {
        self.store.filtered_view()
    }

    /// The durable cache backing this pipeline.
    pub fn cache(&self) -> &PeriodCache {
        &self.cache
    }

    /// Periods currently held in memory, in load order.
    pub fn loaded_periods(&self) -> Vec<PeriodId> {
        let state = self.state.lock().expect("pipeline state poisoned");
        state.loaded.keys().cloned().collect()
    }

    /// Latest load telemetry per period.
    pub fn load_stats(&self) -> Vec<(PeriodId, PeriodLoadStats)> {
        let state = self.state.lock().expect("pipeline state poisoned");
        state
            .stats
            .iter()
            .map(|(period_id, stats)| (period_id.clone(), stats.clone()))
            .collect()
    }

    /// Per-period record counts of the canonical dataset.
    pub fn period_distribution(&self) -> HashMap<PeriodId, usize> {
        let mut counts = HashMap::new();
        for record in self.store.snapshot() {
            if let Some(period) = record.period() {
                *counts.entry(period.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn wait_for_slot(slot: &LoadSlot) -> LoadOutcome {
        let mut outcome = slot.outcome.lock().expect("load slot poisoned");
        while outcome.is_none() {
            outcome = slot.done.wait(outcome).expect("load slot poisoned");
        }
        outcome.clone().expect("load slot resolved")
    }

    /// Record telemetry and the in-memory result, then release the
    /// in-flight guard and wake waiters on success and failure alike.
    fn finish_load(
        &self,
        period_id: &str,
        slot: &Arc<LoadSlot>,
        outcome: LoadOutcome,
        from_cache: bool,
        started: Instant,
    ) -> LoadOutcome {
        {
            let mut state = self.state.lock().expect("pipeline state poisoned");
            let entry = state.stats.entry(period_id.to_string()).or_default();
            entry.last_load_ms = started.elapsed().as_millis();
            entry.from_cache = from_cache;
            match &outcome {
                Ok(dataset) => {
                    entry.last_record_count = dataset.records.len();
                    let seconds = started.elapsed().as_secs_f64();
                    entry.last_records_per_sec = if seconds > 0.0 {
                        dataset.records.len() as f64 / seconds
                    } else {
                        0.0
                    };
                    entry.last_error = None;
                }
                Err(err) => {
                    entry.last_error = Some(err.to_string());
                    entry.error_count = entry.error_count.saturating_add(1);
                }
            }
            if let Ok(dataset) = &outcome {
                state.loaded.insert(period_id.to_string(), Arc::clone(dataset));
            }
            state.in_flight.remove(period_id);
        }
        {
            let mut pending = slot.outcome.lock().expect("load slot poisoned");
            *pending = Some(outcome.clone());
        }
        slot.done.notify_all();
        outcome
    }

    fn perform_load(&self, period_id: &str, force_reload: bool) -> (LoadOutcome, bool) {
        info!(period_id, force_reload, "loading period dataset");
        if !force_reload
            && let Some(dataset) = self.cache.get(period_id)
        {
            info!(
                period_id,
                records = dataset.records.len(),
                "period served from durable cache"
            );
            self.report(1.0, &format!("{period_id} loaded from cache"));
            return (Ok(Arc::new(dataset)), true);
        }

        self.report(0.05, &format!("retrieving {period_id}"));
        let bytes = match self.fetcher.fetch_period(period_id) {
            Ok(bytes) => bytes,
            Err(err) => return (Err(err), false),
        };
        self.report(0.15, &format!("{period_id} retrieved; decoding"));

        let records = match self.decode_payload(period_id, bytes) {
            Ok(records) => records,
            Err(err) => return (Err(err), false),
        };
        let dataset = Arc::new(PeriodDataset::new(period_id, records));
        if dataset.is_empty() {
            warn!(period_id, "period payload contained no records");
        }

        // The durable write happens off the load path; failures are logged,
        // never propagated.
        let cache = Arc::clone(&self.cache);
        let for_cache = Arc::clone(&dataset);
        thread::spawn(move || {
            if !cache.set(&for_cache) {
                warn!(period_id = %for_cache.period_id, "background cache write failed");
            }
        });

        self.report(
            1.0,
            &format!("{period_id} loaded ({} records)", dataset.records.len()),
        );
        (Ok(dataset), false)
    }

    /// Decode retrieved bytes through the dispatcher; a dispatcher-level
    /// crash or timeout is retried exactly once on the fallback path.
    fn decode_payload(
        &self,
        period_id: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<Record>, IngestError> {
        let progress = self.progress.as_ref().map(|sink| {
            let sink = Arc::clone(sink);
            let label = period_id.to_string();
            Arc::new(move |fraction: f64, message: &str| {
                sink(0.15 + fraction * 0.75, &format!("{label}: {message}"))
            }) as ProgressSink
        });
        let payload = TaskPayload::Bytes {
            period_id: period_id.to_string(),
            bytes,
        };
        let outcome = match self
            .dispatcher
            .run(TaskKind::DecompressAndParse, payload.clone(), progress.clone())
        {
            Err(err @ (IngestError::TaskTimeout { .. } | IngestError::WorkerUnavailable(_))) => {
                warn!(
                    period_id,
                    error = %err,
                    "offloaded decode failed; retrying once on the fallback path"
                );
                self.dispatcher
                    .run_inline(TaskKind::DecompressAndParse, payload, progress.as_ref())?
            }
            other => other?,
        };
        match outcome {
            TaskOutcome::Records(records) => Ok(records),
            other => Err(IngestError::Configuration(format!(
                "unexpected decode outcome: {}",
                other.describe()
            ))),
        }
    }

    fn report(&self, fraction: f64, message: &str) {
        if let Some(sink) = self.progress.as_ref() {
            sink(fraction, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::retrieval::InMemoryPeriodFetcher;
    use crate::utils::gzip_bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    fn payload_for(period_id: &str, count: usize) -> Vec<u8> {
        let rows: Vec<String> = (0..count)
            .map(|idx| {
                format!(
                    r#"{{"date": "{period_id}-01-{:02}", "usd_amount": {}, "seq": {idx}}}"#,
                    idx % 28 + 1,
                    idx as f64 * 2.0
                )
            })
            .collect();
        format!(r#"{{"details": [{}]}}"#, rows.join(",")).into_bytes()
    }

    fn pipeline_with(fetcher: InMemoryPeriodFetcher, dir: &std::path::Path) -> LoadPipeline {
        pipeline_with_boxed(Box::new(fetcher), dir)
    }

    fn pipeline_with_boxed(
        fetcher: Box<dyn crate::retrieval::PeriodFetcher>,
        dir: &std::path::Path,
    ) -> LoadPipeline {
        let config = PipelineConfig {
            cache: CacheConfig::default(),
            ..PipelineConfig::default()
        };
        LoadPipeline::open(fetcher, dir.join("cache.bin"), config).unwrap()
    }

    #[test]
    fn concurrent_loads_of_one_period_share_a_single_fetch() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(
            InMemoryPeriodFetcher::new()
                .with_period("2024", gzip_bytes(&payload_for("2024", 50)).unwrap())
                .with_delay("2024", Duration::from_millis(40)),
        );
        let pipeline = pipeline_with_boxed(Box::new(Arc::clone(&fetcher)), dir.path());

        let (first, second) = thread::scope(|scope| {
            let a = scope.spawn(|| pipeline.load_period("2024", false));
            let b = scope.spawn(|| pipeline.load_period("2024", false));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.records.len(), 50);
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn markup_body_surfaces_as_a_format_error() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2024", b"<!DOCTYPE html><html>404</html>".to_vec());
        let pipeline = pipeline_with(fetcher, dir.path());
        let err = pipeline.load_period("2024", false).unwrap_err();
        assert!(matches!(err, IngestError::Format { .. }));
    }

    #[test]
    fn failed_load_releases_the_guard_and_allows_retry() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2024", payload_for("2024", 5))
            .with_scripted_failure(
                "2024",
                IngestError::Retrieval {
                    period_id: "2024".to_string(),
                    reason: "scripted outage".to_string(),
                },
            );
        let pipeline = pipeline_with(fetcher, dir.path());

        let err = pipeline.load_period("2024", false).unwrap_err();
        assert!(matches!(err, IngestError::Retrieval { .. }));
        let stats = pipeline.load_stats();
        let (_, stat) = stats.iter().find(|(id, _)| id == "2024").unwrap();
        assert_eq!(stat.error_count, 1);
        assert!(stat.last_error.is_some());

        // The in-flight guard was released; the retry succeeds.
        let dataset = pipeline.load_period("2024", false).unwrap();
        assert_eq!(dataset.records.len(), 5);
    }

    #[test]
    fn merge_all_concatenates_in_request_order_despite_completion_order() {
        let dir = tempdir().unwrap();
        // 2023 finishes last even though it is requested first.
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2023", payload_for("2023", 10))
            .with_period("2024", payload_for("2024", 10))
            .with_delay("2023", Duration::from_millis(60));
        let pipeline = pipeline_with(fetcher, dir.path());

        let merged = pipeline
            .merge_all(&["2023".to_string(), "2024".to_string()], false)
            .unwrap();
        assert_eq!(merged, 20);
        let snapshot = pipeline.store().snapshot();
        assert!(snapshot[..10].iter().all(|r| r.period() == Some("2023")));
        assert!(snapshot[10..].iter().all(|r| r.period() == Some("2024")));
        assert_eq!(pipeline.store().mutation_count(), 1);
    }

    #[test]
    fn merge_all_failure_leaves_the_canonical_dataset_untouched() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2023", payload_for("2023", 4));
        let pipeline = pipeline_with(fetcher, dir.path());
        pipeline.merge_all(&["2023".to_string()], false).unwrap();
        assert_eq!(pipeline.store().len(), 4);

        let err = pipeline
            .merge_all(&["2023".to_string(), "2025".to_string()], false)
            .unwrap_err();
        assert!(matches!(err, IngestError::Retrieval { .. }));
        // Previously loaded periods stay intact and usable.
        assert_eq!(pipeline.store().len(), 4);
    }

    #[test]
    fn remove_period_clears_memory_dataset_and_cache_idempotently() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2023", payload_for("2023", 4))
            .with_period("2024", payload_for("2024", 6));
        let pipeline = pipeline_with(fetcher, dir.path());
        pipeline
            .merge_all(&["2023".to_string(), "2024".to_string()], false)
            .unwrap();
        assert_eq!(pipeline.store().len(), 10);

        assert_eq!(pipeline.remove_period("2024"), 6);
        assert_eq!(pipeline.store().len(), 4);
        assert!(!pipeline.loaded_periods().contains(&"2024".to_string()));
        assert!(pipeline.cache().get("2024").is_none());

        assert_eq!(pipeline.remove_period("2024"), 0);
        assert_eq!(pipeline.store().len(), 4);
    }

    #[test]
    fn catalog_stamp_first_sighting_forces_reload() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2024", payload_for("2024", 3))
            .with_catalog(Catalog {
                periods: vec!["2024".to_string()],
                last_update: Some("stamp-1".to_string()),
                needs_reload: false,
            });
        let pipeline = pipeline_with(fetcher, dir.path());

        // First sighting of a stamp forces a fresh load.
        let catalog = pipeline.refresh_catalog().unwrap();
        assert!(catalog.needs_reload);
        // Same stamp afterwards: cached data is fine.
        let catalog = pipeline.refresh_catalog().unwrap();
        assert!(!catalog.needs_reload);
    }

    #[test]
    fn memory_hit_skips_fetching_and_returns_the_same_dataset() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2024", payload_for("2024", 8));
        let pipeline = pipeline_with(fetcher, dir.path());
        let first = pipeline.load_period("2024", false).unwrap();
        let second = pipeline.load_period("2024", false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn period_distribution_counts_by_record_attribution() {
        let dir = tempdir().unwrap();
        let fetcher = InMemoryPeriodFetcher::new()
            .with_period("2023", payload_for("2023", 3))
            .with_period("2024", payload_for("2024", 7));
        let pipeline = pipeline_with(fetcher, dir.path());
        pipeline
            .merge_all(&["2023".to_string(), "2024".to_string()], false)
            .unwrap();
        let counts = pipeline.period_distribution();
        assert_eq!(counts.get("2023"), Some(&3));
        assert_eq!(counts.get("2024"), Some(&7));
    }
}
