use std::fmt;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::constants::processor::{DEFAULT_CHUNK_SIZE, MAX_CONCURRENT_CHUNKS, OFFLOAD_THRESHOLD};
use crate::data::Record;
use crate::dispatcher::TaskDispatcher;
use crate::errors::IngestError;
use crate::tasks::{TaskKind, TaskOutcome, TaskPayload, report};
use crate::types::ProgressSink;

/// Cooperative pause invoked between chunk batches so the interactive
/// surface stays responsive.
///
/// The underlying primitive is injectable; schedulers and tests can
/// substitute their own idle hook. Pauses are observable only in timing,
/// never in output.
#[derive(Clone)]
pub struct YieldPoint(Arc<dyn Fn() + Send + Sync>);

impl YieldPoint {
    /// Yield point backed by a custom hook.
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    /// Pause once.
    pub fn pause(&self) {
        (self.0)()
    }
}

impl Default for YieldPoint {
    fn default() -> Self {
        Self(Arc::new(thread::yield_now))
    }
}

impl fmt::Debug for YieldPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("YieldPoint")
    }
}

/// Splits large record sets into ordered chunks and transforms them with
/// bounded concurrency.
///
/// Chunk outputs are appended strictly in chunk order, so the final
/// sequence always preserves input order regardless of how many chunks ran
/// concurrently.
pub struct ChunkedProcessor {
    dispatcher: Arc<TaskDispatcher>,
    chunk_size: usize,
    max_concurrent: usize,
    offload_threshold: usize,
    yield_point: YieldPoint,
}

impl ChunkedProcessor {
    /// Processor with default chunking over the given dispatcher.
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: MAX_CONCURRENT_CHUNKS,
            offload_threshold: OFFLOAD_THRESHOLD,
            yield_point: YieldPoint::default(),
        }
    }

    /// Override the records-per-chunk limit.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Override the per-batch concurrency bound.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Override the dataset size above which chunks are offloaded.
    pub fn with_offload_threshold(mut self, offload_threshold: usize) -> Self {
        self.offload_threshold = offload_threshold;
        self
    }

    /// Override the cooperative yield hook.
    pub fn with_yield_point(mut self, yield_point: YieldPoint) -> Self {
        self.yield_point = yield_point;
        self
    }

    /// Transform `records` chunk by chunk, preserving input order.
    ///
    /// `progress` fires at least once per chunk with non-decreasing
    /// fractions in `[0, 1]`.
    pub fn process(
        &self,
        records: Vec<Record>,
        progress: Option<&ProgressSink>,
    ) -> Result<Vec<Record>, IngestError> {
        if records.is_empty() {
            report(progress, 1.0, "no records to process");
            return Ok(records);
        }
        let total = records.len();
        let offload = total > self.offload_threshold;
        let chunks = split_into_chunks(records, self.chunk_size);
        let chunk_count = chunks.len();
        debug!(
            total,
            chunk_count,
            chunk_size = self.chunk_size,
            offload,
            "processing records in chunks"
        );

        let mut output = Vec::with_capacity(total);
        let mut processed_chunks = 0usize;
        let mut remaining = chunks.into_iter();
        loop {
            let batch: Vec<Vec<Record>> = remaining.by_ref().take(self.max_concurrent).collect();
            if batch.is_empty() {
                break;
            }
            let batch_results: Vec<Result<Vec<Record>, IngestError>> = if offload {
                thread::scope(|scope| {
                    let handles: Vec<_> = batch
                        .into_iter()
                        .map(|chunk| scope.spawn(move || self.transform_offloaded(chunk)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| {
                            handle.join().unwrap_or_else(|_| {
                                Err(IngestError::WorkerUnavailable(
                                    "chunk transform thread panicked".to_string(),
                                ))
                            })
                        })
                        .collect()
                })
            } else {
                batch
                    .into_iter()
                    .map(|chunk| self.transform_inline(chunk))
                    .collect()
            };

            // Appends happen in chunk order, never interleaved.
            for result in batch_results {
                output.extend(result?);
                processed_chunks += 1;
                report(
                    progress,
                    processed_chunks as f64 / chunk_count as f64,
                    &format!("processed {processed_chunks} of {chunk_count} chunks"),
                );
            }
            if processed_chunks < chunk_count {
                self.yield_point.pause();
            }
        }
        Ok(output)
    }

    fn transform_offloaded(&self, chunk: Vec<Record>) -> Result<Vec<Record>, IngestError> {
        match self
            .dispatcher
            .run(TaskKind::TransformChunk, TaskPayload::Records(chunk), None)?
        {
            TaskOutcome::Records(records) => Ok(records),
            other => Err(IngestError::Configuration(format!(
                "unexpected transform outcome: {}",
                other.describe()
            ))),
        }
    }

    fn transform_inline(&self, chunk: Vec<Record>) -> Result<Vec<Record>, IngestError> {
        match self.dispatcher.run_inline(
            TaskKind::TransformChunk,
            TaskPayload::Records(chunk),
            None,
        )? {
            TaskOutcome::Records(records) => Ok(records),
            other => Err(IngestError::Configuration(format!(
                "unexpected transform outcome: {}",
                other.describe()
            ))),
        }
    }
}

/// Split records into ordered, contiguous chunks of at most `chunk_size`.
fn split_into_chunks(records: Vec<Record>, chunk_size: usize) -> Vec<Vec<Record>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    let mut rows = records.into_iter();
    loop {
        let chunk: Vec<Record> = rows.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::passthrough_transform;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn indexed_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|idx| {
                Record::default()
                    .with_field("date", "2024-05-01")
                    .with_field("seq", idx as i64)
            })
            .collect()
    }

    fn sequence_of(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .map(|record| record.fields["seq"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn five_thousand_records_split_into_three_ordered_chunks() {
        let chunks = split_into_chunks(indexed_records(5000), 2000);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2000, 2000, 1000]);

        let dispatcher = Arc::new(TaskDispatcher::inline_only(passthrough_transform()));
        let processor = ChunkedProcessor::new(dispatcher).with_chunk_size(2000);
        let output = processor.process(indexed_records(5000), None).unwrap();
        assert_eq!(sequence_of(&output), (0..5000).collect::<Vec<i64>>());
    }

    #[test]
    fn offloaded_processing_preserves_input_order() {
        let dispatcher = Arc::new(TaskDispatcher::new(passthrough_transform()));
        assert!(dispatcher.init());
        let processor = ChunkedProcessor::new(dispatcher)
            .with_chunk_size(100)
            .with_offload_threshold(0);
        let output = processor.process(indexed_records(1050), None).unwrap();
        assert_eq!(sequence_of(&output), (0..1050).collect::<Vec<i64>>());
    }

    #[test]
    fn small_datasets_run_inline_without_touching_the_worker() {
        let dispatcher = Arc::new(TaskDispatcher::new(passthrough_transform()));
        assert!(dispatcher.init());
        let processor = ChunkedProcessor::new(Arc::clone(&dispatcher))
            .with_chunk_size(50)
            .with_offload_threshold(10_000);
        processor.process(indexed_records(120), None).unwrap();
        assert!(dispatcher.stats().fallback_runs() >= 3);
    }

    #[test]
    fn progress_fires_per_chunk_and_never_decreases() {
        let dispatcher = Arc::new(TaskDispatcher::inline_only(passthrough_transform()));
        let processor = ChunkedProcessor::new(dispatcher).with_chunk_size(10);
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |fraction, _| {
            sink_seen.lock().unwrap().push(fraction);
        });
        processor.process(indexed_records(95), Some(&sink)).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!((seen.last().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn yield_point_fires_between_batches_only() {
        let pauses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pauses);
        let dispatcher = Arc::new(TaskDispatcher::inline_only(passthrough_transform()));
        let processor = ChunkedProcessor::new(dispatcher)
            .with_chunk_size(10)
            .with_max_concurrent(3)
            .with_yield_point(YieldPoint::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        // 100 records -> 10 chunks -> 4 batches -> 3 pauses between them.
        processor.process(indexed_records(100), None).unwrap();
        assert_eq!(pauses.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_input_reports_completion_and_returns_empty() {
        let dispatcher = Arc::new(TaskDispatcher::inline_only(passthrough_transform()));
        let processor = ChunkedProcessor::new(dispatcher);
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |fraction, _| {
            sink_seen.lock().unwrap().push(fraction);
        });
        let output = processor.process(Vec::new(), Some(&sink)).unwrap();
        assert!(output.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn transform_is_applied_to_every_record() {
        let transform: crate::types::RecordTransform =
            Arc::new(|record: &Record| record.clone().with_field("processed", true));
        let dispatcher = Arc::new(TaskDispatcher::inline_only(transform));
        let processor = ChunkedProcessor::new(dispatcher).with_chunk_size(7);
        let output = processor.process(indexed_records(20), None).unwrap();
        assert_eq!(output.len(), 20);
        assert!(output.iter().all(|record| record.fields.contains_key("processed")));
    }
}
