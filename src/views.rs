use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::data::Record;
use crate::store::DatasetInner;
use crate::types::RecordFilter;

/// One cached derived copy of the canonical dataset.
///
/// Valid only while its source generation and length match the live
/// dataset; otherwise it is recomputed, never patched.
#[derive(Clone)]
pub struct ViewSnapshot {
    /// Shared snapshot data.
    pub data: Arc<Vec<Record>>,
    /// Canonical generation the snapshot was derived from.
    pub source_generation: u64,
    /// Canonical length at derivation time.
    pub source_len: usize,
    /// Derivation instant, for age-based re-derivation.
    pub taken_at: Instant,
}

#[derive(Default)]
struct ViewState {
    base: Option<ViewSnapshot>,
    filtered: Option<ViewSnapshot>,
}

/// Lazily derives and caches base/filtered copies of the canonical dataset.
///
/// A snapshot is derived on first access and returned unchanged until the
/// dataset's generation or length moves, the snapshot ages out, or
/// [`invalidate`](Self::invalidate) runs.
#[derive(Clone)]
pub struct ViewManager {
    inner: Arc<RwLock<DatasetInner>>,
    state: Arc<Mutex<ViewState>>,
    filter: Option<RecordFilter>,
    max_age: Duration,
}

impl ViewManager {
    pub(crate) fn new(
        inner: Arc<RwLock<DatasetInner>>,
        filter: Option<RecordFilter>,
        max_age: Duration,
    ) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(ViewState::default())),
            filter,
            max_age,
        }
    }

    /// Unfiltered snapshot of the canonical dataset.
    pub fn base(&self) -> Arc<Vec<Record>> {
        let (generation, len) = self.source_shape();
        {
            let state = self.state.lock().expect("view state poisoned");
            if let Some(snapshot) = state.base.as_ref()
                && self.snapshot_valid(snapshot, generation, len)
            {
                return Arc::clone(&snapshot.data);
            }
        }
        let snapshot = self.derive(false);
        let data = Arc::clone(&snapshot.data);
        self.state.lock().expect("view state poisoned").base = Some(snapshot);
        data
    }

    /// Filtered snapshot of the canonical dataset. Without a configured
    /// predicate this is a plain copy, same as the base view.
    pub fn filtered(&self) -> Arc<Vec<Record>> {
        let (generation, len) = self.source_shape();
        {
            let state = self.state.lock().expect("view state poisoned");
            if let Some(snapshot) = state.filtered.as_ref()
                && self.snapshot_valid(snapshot, generation, len)
            {
                return Arc::clone(&snapshot.data);
            }
        }
        let snapshot = self.derive(true);
        let data = Arc::clone(&snapshot.data);
        self.state.lock().expect("view state poisoned").filtered = Some(snapshot);
        data
    }

    /// Drop cached snapshots; the next access re-derives.
    ///
    /// Called by the dataset store after every mutation.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().expect("view state poisoned");
        state.base = None;
        state.filtered = None;
        debug!("view snapshots invalidated");
    }

    fn source_shape(&self) -> (u64, usize) {
        let inner = self.inner.read().expect("dataset store poisoned");
        (inner.generation, inner.records.len())
    }

    fn snapshot_valid(&self, snapshot: &ViewSnapshot, generation: u64, len: usize) -> bool {
        snapshot.source_generation == generation
            && snapshot.source_len == len
            && snapshot.taken_at.elapsed() <= self.max_age
    }

    fn derive(&self, filtered: bool) -> ViewSnapshot {
        let inner = self.inner.read().expect("dataset store poisoned");
        let data: Vec<Record> = match (filtered, self.filter.as_ref()) {
            (true, Some(filter)) => inner
                .records
                .iter()
                .filter(|record| filter(record))
                .cloned()
                .collect(),
            _ => inner.records.clone(),
        };
        ViewSnapshot {
            source_generation: inner.generation,
            source_len: inner.records.len(),
            taken_at: Instant::now(),
            data: Arc::new(data),
        }
    }
}
