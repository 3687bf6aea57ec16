use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::constants::views::MAX_SNAPSHOT_AGE_SECS;
use crate::data::Record;
use crate::types::RecordFilter;
use crate::views::ViewManager;

/// Canonical dataset state shared read-only with the view manager.
pub(crate) struct DatasetInner {
    pub(crate) records: Vec<Record>,
    pub(crate) generation: u64,
}

/// Mutation counters behind the notification surface.
#[derive(Default)]
struct StoreStats {
    mutations: u64,
}

/// The single shared canonical dataset.
///
/// There is exactly one writer (the load pipeline); readers obtain
/// immutable snapshots or derived views. Every mutator bumps the dataset
/// generation, invalidates cached views, and notifies waiters, so mutation
/// and invalidation cannot be separated.
#[derive(Clone)]
pub struct DatasetStore {
    inner: Arc<RwLock<DatasetInner>>,
    notifier: Arc<(Mutex<StoreStats>, Condvar)>,
    views: ViewManager,
}

impl DatasetStore {
    /// Empty store with default view settings.
    pub fn new() -> Self {
        Self::with_view_settings(None, Duration::from_secs(MAX_SNAPSHOT_AGE_SECS))
    }

    /// Empty store with a filtered-view predicate and snapshot age limit.
    pub fn with_view_settings(filter: Option<RecordFilter>, view_max_age: Duration) -> Self {
        let inner = Arc::new(RwLock::new(DatasetInner {
            records: Vec::new(),
            generation: 0,
        }));
        Self {
            views: ViewManager::new(Arc::clone(&inner), filter, view_max_age),
            inner,
            notifier: Arc::new((Mutex::new(StoreStats::default()), Condvar::new())),
        }
    }

    /// Replace the entire canonical dataset.
    pub fn replace(&self, records: Vec<Record>) {
        {
            let mut inner = self.inner.write().expect("dataset store poisoned");
            inner.records = records;
            inner.generation += 1;
        }
        self.after_mutation("replace");
    }

    /// Append records to the canonical dataset.
    pub fn append(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.write().expect("dataset store poisoned");
            inner.records.extend(records);
            inner.generation += 1;
        }
        self.after_mutation("append");
    }

    /// Drop all records attributable to `period_id`; records without a date
    /// stay. Returns the removed count. Safe to call twice.
    pub fn remove_period(&self, period_id: &str) -> usize {
        let removed = {
            let mut inner = self.inner.write().expect("dataset store poisoned");
            let before = inner.records.len();
            inner
                .records
                .retain(|record| record.period().is_none_or(|period| period != period_id));
            let removed = before - inner.records.len();
            if removed > 0 {
                inner.generation += 1;
            }
            removed
        };
        if removed > 0 {
            self.after_mutation("remove_period");
        }
        removed
    }

    /// Cloned copy of the canonical records.
    pub fn snapshot(&self) -> Vec<Record> {
        self.inner
            .read()
            .expect("dataset store poisoned")
            .records
            .clone()
    }

    /// Number of canonical records.
    pub fn len(&self) -> usize {
        self.inner.read().expect("dataset store poisoned").records.len()
    }

    /// True when the canonical dataset holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity of the current dataset contents; changes on every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.read().expect("dataset store poisoned").generation
    }

    /// Number of completed mutations (the consumer notification surface).
    pub fn mutation_count(&self) -> u64 {
        let (lock, _) = &*self.notifier;
        lock.lock().expect("dataset store stats poisoned").mutations
    }

    /// Wait until the mutation count exceeds `last_seen`, or until timeout.
    pub fn wait_for_mutation(&self, last_seen: u64, timeout: Duration) -> u64 {
        let (lock, cvar) = &*self.notifier;
        let mut stats = lock.lock().expect("dataset store stats poisoned");
        while stats.mutations <= last_seen {
            let result = cvar
                .wait_timeout(stats, timeout)
                .expect("dataset store stats poisoned");
            stats = result.0;
            if result.1.timed_out() {
                break;
            }
        }
        stats.mutations
    }

    /// The lazy view manager bound to this store.
    pub fn views(&self) -> &ViewManager {
        &self.views
    }

    /// Base view snapshot (delegates to the view manager).
    pub fn base_view(&self) -> Arc<Vec<Record>> {
        self.views.base()
    }

    /// Filtered view snapshot (delegates to the view manager).
    pub fn filtered_view(&self) -> Arc<Vec<Record>> {
        self.views.filtered()
    }

    fn after_mutation(&self, op: &str) {
        self.views.invalidate();
        let (lock, cvar) = &*self.notifier;
        let mut stats = lock.lock().expect("dataset store stats poisoned");
        stats.mutations = stats.mutations.saturating_add(1);
        cvar.notify_all();
        debug!(op, "canonical dataset mutated");
    }
}

impl Default for DatasetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(date: &str, product: &str) -> Record {
        Record::default()
            .with_field("date", date)
            .with_field("product", product)
    }

    #[test]
    fn mutators_bump_generation_and_mutation_count() {
        let store = DatasetStore::new();
        assert_eq!(store.generation(), 0);
        assert_eq!(store.mutation_count(), 0);

        store.replace(vec![record("2024-01-01", "a")]);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.mutation_count(), 1);
        assert_eq!(store.len(), 1);

        store.append(vec![record("2024-01-02", "b")]);
        assert_eq!(store.generation(), 2);
        assert_eq!(store.len(), 2);

        // Empty appends are not mutations.
        store.append(Vec::new());
        assert_eq!(store.generation(), 2);
        assert_eq!(store.mutation_count(), 2);
    }

    #[test]
    fn remove_period_drops_only_attributable_records_and_is_idempotent() {
        let store = DatasetStore::new();
        store.replace(vec![
            record("2023-05-01", "a"),
            record("2024-05-01", "b"),
            record("2024-06-01", "c"),
            Record::default().with_field("product", "dateless"),
        ]);
        assert_eq!(store.remove_period("2024"), 2);
        assert_eq!(store.len(), 2);
        let remaining = store.snapshot();
        assert!(remaining.iter().any(|r| r.get_str("product") == Some("a")));
        assert!(remaining.iter().any(|r| r.get_str("product") == Some("dateless")));

        let generation = store.generation();
        assert_eq!(store.remove_period("2024"), 0);
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn wait_for_mutation_wakes_on_writes() {
        let store = DatasetStore::new();
        let waiter = store.clone();
        let handle =
            thread::spawn(move || waiter.wait_for_mutation(0, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        store.replace(vec![record("2024-01-01", "a")]);
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn wait_for_mutation_times_out_quietly() {
        let store = DatasetStore::new();
        assert_eq!(store.wait_for_mutation(0, Duration::from_millis(5)), 0);
    }
}
