use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::constants::dispatcher::{READY_TIMEOUT_SECS, TASK_TIMEOUT_SECS};
use crate::errors::IngestError;
use crate::tasks::{TaskKind, TaskOutcome, TaskPayload, run_task};
use crate::types::{ProgressSink, RecordTransform, TaskId};

/// Messages sent from the worker context back to the dispatcher, correlated
/// by task id.
#[derive(Debug)]
enum WorkerEvent {
    Ready { compression_available: bool },
    Progress {
        task_id: TaskId,
        fraction: f64,
        message: String,
    },
    Success {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    Error {
        task_id: TaskId,
        error: IngestError,
    },
}

/// One queued unit of work sent to the worker context.
struct TaskRequest {
    task_id: TaskId,
    kind: TaskKind,
    payload: TaskPayload,
}

struct PendingTask {
    done: Sender<Result<TaskOutcome, IngestError>>,
    progress: Option<ProgressSink>,
}

type PendingTable = Arc<Mutex<HashMap<TaskId, PendingTask>>>;

struct WorkerHandle {
    requests: Sender<TaskRequest>,
}

/// Runtime counters for dispatcher activity.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    fallback_runs: AtomicU64,
}

impl DispatcherStats {
    /// Total tasks submitted through [`TaskDispatcher::run`].
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Tasks that completed successfully on either path.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Tasks that failed on either path.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Tasks executed on the synchronous fallback path.
    pub fn fallback_runs(&self) -> u64 {
        self.fallback_runs.load(Ordering::Relaxed)
    }
}

/// Offloads decompress/parse/transform tasks to one background worker
/// context, falling back to synchronous execution transparently when the
/// context is unavailable.
///
/// Task ids are monotonically assigned and never reused; every worker
/// message carries the id it answers, and the matching pending entry is
/// removed exactly once.
pub struct TaskDispatcher {
    transform: RecordTransform,
    ready_timeout: Duration,
    task_timeout: Duration,
    offload_enabled: bool,
    next_task_id: AtomicU64,
    pending: PendingTable,
    worker: Mutex<Option<WorkerHandle>>,
    stats: DispatcherStats,
}

impl TaskDispatcher {
    /// Dispatcher with default timeouts and the given per-record transform.
    pub fn new(transform: RecordTransform) -> Self {
        Self {
            transform,
            ready_timeout: Duration::from_secs(READY_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(TASK_TIMEOUT_SECS),
            offload_enabled: true,
            next_task_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            worker: Mutex::new(None),
            stats: DispatcherStats::default(),
        }
    }

    /// Dispatcher that always executes tasks in the calling context.
    pub fn inline_only(transform: RecordTransform) -> Self {
        let mut dispatcher = Self::new(transform);
        dispatcher.offload_enabled = false;
        dispatcher
    }

    /// Override readiness and per-task timeouts.
    pub fn with_timeouts(mut self, ready_timeout: Duration, task_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self.task_timeout = task_timeout;
        self
    }

    /// Attempt to start the worker context. Returns readiness; when `false`,
    /// subsequent [`run`](Self::run) calls execute inline.
    pub fn init(&self) -> bool {
        if !self.offload_enabled {
            return false;
        }
        let mut guard = self.worker.lock().expect("dispatcher worker slot poisoned");
        if guard.is_some() {
            return true;
        }
        match self.spawn_worker() {
            Some(handle) => {
                *guard = Some(handle);
                true
            }
            None => false,
        }
    }

    /// True when a worker context is currently live.
    pub fn is_ready(&self) -> bool {
        self.worker
            .lock()
            .expect("dispatcher worker slot poisoned")
            .is_some()
    }

    /// Runtime counters.
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// The per-record transform this dispatcher applies to `TransformChunk`
    /// tasks on both paths.
    pub fn transform(&self) -> RecordTransform {
        Arc::clone(&self.transform)
    }

    /// Run one task, preferring the worker context. Callers cannot observe
    /// which path executed.
    pub fn run(
        &self,
        kind: TaskKind,
        payload: TaskPayload,
        progress: Option<ProgressSink>,
    ) -> Result<TaskOutcome, IngestError> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if !self.ensure_worker() {
            return self.run_inline(kind, payload, progress.as_ref());
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, done_rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("pending task table poisoned")
            .insert(
                task_id,
                PendingTask {
                    done: done_tx,
                    progress,
                },
            );

        let request = TaskRequest {
            task_id,
            kind,
            payload,
        };
        let send_result = {
            let guard = self.worker.lock().expect("dispatcher worker slot poisoned");
            match guard.as_ref() {
                Some(handle) => handle.requests.send(request).map_err(|err| err.0),
                None => Err(request),
            }
        };
        if let Err(request) = send_result {
            // The worker died between the readiness check and the send; fail
            // over inline with the payload the channel handed back.
            self.pending
                .lock()
                .expect("pending task table poisoned")
                .remove(&task_id);
            self.teardown("request channel closed");
            return self.run_inline(request.kind, request.payload, None);
        }

        match done_rx.recv_timeout(self.task_timeout) {
            Ok(result) => {
                match &result {
                    Ok(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
                };
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.teardown("task timeout");
                Err(IngestError::TaskTimeout {
                    task_id,
                    seconds: self.task_timeout.as_secs(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.teardown("worker stopped");
                Err(IngestError::WorkerUnavailable(
                    "worker stopped before completing the task".to_string(),
                ))
            }
        }
    }

    /// Run one task in the calling context (the synchronous fallback path).
    pub fn run_inline(
        &self,
        kind: TaskKind,
        payload: TaskPayload,
        progress: Option<&ProgressSink>,
    ) -> Result<TaskOutcome, IngestError> {
        self.stats.fallback_runs.fetch_add(1, Ordering::Relaxed);
        let result = run_task(kind, payload, &self.transform, progress);
        match &result {
            Ok(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Stop the worker context and fail any pending tasks.
    pub fn terminate(&self) {
        self.teardown("terminated");
    }

    /// Re-attempt initialization when the context was torn down.
    fn ensure_worker(&self) -> bool {
        if !self.offload_enabled {
            return false;
        }
        if self.is_ready() {
            return true;
        }
        self.init()
    }

    fn spawn_worker(&self) -> Option<WorkerHandle> {
        let (request_tx, request_rx) = mpsc::channel::<TaskRequest>();
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
        let transform = Arc::clone(&self.transform);
        thread::Builder::new()
            .name("almanac-task-worker".to_string())
            .spawn(move || worker_loop(request_rx, event_tx, transform))
            .ok()?;

        match event_rx.recv_timeout(self.ready_timeout) {
            Ok(WorkerEvent::Ready {
                compression_available,
            }) => {
                debug!(compression_available, "task worker ready");
            }
            Ok(other) => {
                warn!(?other, "unexpected first worker message; using inline execution");
                return None;
            }
            Err(_) => {
                warn!("task worker failed to signal readiness; using inline execution");
                return None;
            }
        }

        let pending = Arc::clone(&self.pending);
        thread::Builder::new()
            .name("almanac-task-router".to_string())
            .spawn(move || router_loop(event_rx, pending))
            .ok()?;
        Some(WorkerHandle {
            requests: request_tx,
        })
    }

    fn teardown(&self, reason: &str) {
        {
            let mut guard = self.worker.lock().expect("dispatcher worker slot poisoned");
            if guard.take().is_some() {
                warn!(reason, "tearing down worker context");
            }
        }
        let drained: Vec<(TaskId, PendingTask)> = self
            .pending
            .lock()
            .expect("pending task table poisoned")
            .drain()
            .collect();
        for (task_id, entry) in drained {
            let _ = entry.done.send(Err(IngestError::WorkerUnavailable(format!(
                "worker torn down ({reason}) with task {task_id} pending"
            ))));
        }
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        self.teardown("dispatcher dropped");
    }
}

/// Worker loop: announce readiness, then execute requests until the channel
/// closes, answering every request with an id-tagged message.
fn worker_loop(
    requests: Receiver<TaskRequest>,
    events: Sender<WorkerEvent>,
    transform: RecordTransform,
) {
    if events
        .send(WorkerEvent::Ready {
            compression_available: true,
        })
        .is_err()
    {
        return;
    }
    while let Ok(request) = requests.recv() {
        let TaskRequest {
            task_id,
            kind,
            payload,
        } = request;
        let progress_events = events.clone();
        let sink: ProgressSink = Arc::new(move |fraction, message: &str| {
            let _ = progress_events.send(WorkerEvent::Progress {
                task_id,
                fraction,
                message: message.to_string(),
            });
        });
        let event = match run_task(kind, payload, &transform, Some(&sink)) {
            Ok(outcome) => WorkerEvent::Success { task_id, outcome },
            Err(error) => WorkerEvent::Error { task_id, error },
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Router loop: match worker messages against the pending table by task id.
/// A disconnect means the worker is gone; everything still pending fails.
fn router_loop(events: Receiver<WorkerEvent>, pending: PendingTable) {
    loop {
        match events.recv() {
            Ok(WorkerEvent::Ready { .. }) => {}
            Ok(WorkerEvent::Progress {
                task_id,
                fraction,
                message,
            }) => {
                let sink = pending
                    .lock()
                    .expect("pending task table poisoned")
                    .get(&task_id)
                    .and_then(|entry| entry.progress.clone());
                if let Some(sink) = sink {
                    sink(fraction, &message);
                }
            }
            Ok(WorkerEvent::Success { task_id, outcome }) => {
                complete(&pending, task_id, Ok(outcome));
            }
            Ok(WorkerEvent::Error { task_id, error }) => {
                complete(&pending, task_id, Err(error));
            }
            Err(_) => {
                let drained: Vec<(TaskId, PendingTask)> = pending
                    .lock()
                    .expect("pending task table poisoned")
                    .drain()
                    .collect();
                for (task_id, entry) in drained {
                    let _ = entry.done.send(Err(IngestError::WorkerUnavailable(format!(
                        "worker stopped with task {task_id} pending"
                    ))));
                }
                return;
            }
        }
    }
}

fn complete(pending: &PendingTable, task_id: TaskId, result: Result<TaskOutcome, IngestError>) {
    let entry = pending
        .lock()
        .expect("pending task table poisoned")
        .remove(&task_id);
    match entry {
        Some(entry) => {
            let _ = entry.done.send(result);
        }
        // Stale completions from a torn-down context land here; ids are
        // never reused, so they cannot resolve a newer task.
        None => warn!(task_id, "completion for unknown task id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Record, passthrough_transform};
    use crate::utils::gzip_bytes;
    use std::sync::Mutex as StdMutex;

    fn sample_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|idx| {
                Record::default()
                    .with_field("date", format!("2024-01-{:02}", idx % 28 + 1))
                    .with_field("seq", idx as i64)
            })
            .collect()
    }

    #[test]
    fn offloaded_and_inline_transform_chunk_agree() {
        let transform: RecordTransform =
            Arc::new(|record: &Record| record.clone().with_field("marked", true));
        let offloaded = TaskDispatcher::new(Arc::clone(&transform));
        assert!(offloaded.init());
        let inline = TaskDispatcher::inline_only(transform);
        assert!(!inline.init());

        let records = sample_records(12);
        let via_worker = offloaded
            .run(
                TaskKind::TransformChunk,
                TaskPayload::Records(records.clone()),
                None,
            )
            .unwrap();
        let via_fallback = inline
            .run(
                TaskKind::TransformChunk,
                TaskPayload::Records(records),
                None,
            )
            .unwrap();
        assert_eq!(via_worker, via_fallback);
        assert_eq!(inline.stats().fallback_runs(), 1);
    }

    #[test]
    fn decompress_and_parse_matches_on_both_paths() {
        let payload =
            br#"{"details": [{"date": "2024-02-01", "usd_amount": 10.0}, {"date": "2024-02-02"}]}"#;
        let compressed = gzip_bytes(payload).unwrap();
        let bytes_payload = TaskPayload::Bytes {
            period_id: "2024".to_string(),
            bytes: compressed,
        };

        let offloaded = TaskDispatcher::new(passthrough_transform());
        assert!(offloaded.init());
        let via_worker = offloaded
            .run(TaskKind::DecompressAndParse, bytes_payload.clone(), None)
            .unwrap();

        let inline = TaskDispatcher::inline_only(passthrough_transform());
        let via_fallback = inline
            .run(TaskKind::DecompressAndParse, bytes_payload, None)
            .unwrap();
        assert_eq!(via_worker, via_fallback);
    }

    #[test]
    fn worker_errors_are_routed_back_by_task_id() {
        let dispatcher = TaskDispatcher::new(passthrough_transform());
        assert!(dispatcher.init());
        let err = dispatcher
            .run(
                TaskKind::DecompressAndParse,
                TaskPayload::Bytes {
                    period_id: "2024".to_string(),
                    bytes: b"<!DOCTYPE html>".to_vec(),
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::Format { .. }));
        // The pending table entry was removed exactly once.
        assert!(dispatcher.pending.lock().unwrap().is_empty());
        // The context survives a task-level failure.
        assert!(dispatcher.is_ready());
    }

    #[test]
    fn task_timeout_tears_down_and_next_run_reinitializes() {
        let transform: RecordTransform = Arc::new(|record: &Record| {
            thread::sleep(Duration::from_millis(200));
            record.clone()
        });
        let dispatcher = TaskDispatcher::new(transform)
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(20));
        assert!(dispatcher.init());

        let err = dispatcher
            .run(
                TaskKind::TransformChunk,
                TaskPayload::Records(sample_records(1)),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::TaskTimeout { .. }));
        assert!(!dispatcher.is_ready());

        // A parse task has no transform stage, so the fresh context answers
        // well inside the timeout.
        let outcome = dispatcher
            .run(
                TaskKind::DecompressAndParse,
                TaskPayload::Bytes {
                    period_id: "2024".to_string(),
                    bytes: b"{\"details\": []}".to_vec(),
                },
                None,
            )
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Records(Vec::new()));
        assert!(dispatcher.is_ready());
    }

    #[test]
    fn worker_panic_fails_the_task_and_recovers_on_next_run() {
        let transform: RecordTransform = Arc::new(|record: &Record| {
            if record.get_str("poison").is_some() {
                panic!("poisoned record");
            }
            record.clone()
        });
        let dispatcher = TaskDispatcher::new(transform);
        assert!(dispatcher.init());

        let poisoned = vec![Record::default().with_field("poison", true)];
        let err = dispatcher
            .run(TaskKind::TransformChunk, TaskPayload::Records(poisoned), None)
            .unwrap_err();
        assert!(matches!(err, IngestError::WorkerUnavailable(_)));

        let outcome = dispatcher
            .run(
                TaskKind::TransformChunk,
                TaskPayload::Records(sample_records(2)),
                None,
            )
            .unwrap();
        let TaskOutcome::Records(records) = outcome else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn task_ids_are_monotonic_across_runs() {
        let dispatcher = TaskDispatcher::new(passthrough_transform());
        assert!(dispatcher.init());
        for _ in 0..3 {
            dispatcher
                .run(
                    TaskKind::TransformChunk,
                    TaskPayload::Records(Vec::new()),
                    None,
                )
                .unwrap();
        }
        assert_eq!(dispatcher.next_task_id.load(Ordering::Relaxed), 3);
        assert_eq!(dispatcher.stats().completed(), 3);
    }

    #[test]
    fn progress_messages_reach_the_callers_sink() {
        let dispatcher = TaskDispatcher::new(passthrough_transform());
        assert!(dispatcher.init());
        let seen: Arc<StdMutex<Vec<f64>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |fraction, _| {
            sink_seen.lock().unwrap().push(fraction);
        });
        dispatcher
            .run(
                TaskKind::DecompressAndParse,
                TaskPayload::Bytes {
                    period_id: "2024".to_string(),
                    bytes: b"{\"details\": [{\"date\": \"2024-01-01\"}]}".to_vec(),
                },
                Some(sink),
            )
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
