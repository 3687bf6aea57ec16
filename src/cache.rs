use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use simd_r_drive::storage_engine::DataStore;
use simd_r_drive::storage_engine::traits::{DataStoreReader, DataStoreWriter};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::constants::cache::{
    CATALOG_STAMP_KEY, COMPRESSION_TAG, DEFAULT_STORE_DIR, DEFAULT_STORE_FILENAME,
    ENTRY_RECORD_VERSION, ENTRY_TOMBSTONE, INDEX_KEY, META_KEY, PERIOD_KEY_PREFIX, PLAIN_TAG,
    STORE_VERSION,
};
use crate::data::{PeriodDataset, Record, passthrough_transform};
use crate::dispatcher::TaskDispatcher;
use crate::errors::IngestError;
use crate::tasks::{TaskKind, TaskOutcome, TaskPayload, run_task};
use crate::types::{PeriodId, RecordTransform, VersionToken};
use crate::utils::{daily_version, gzip_bytes, version_token};

/// Persisted envelope for one period dataset.
#[derive(Clone, Debug, bitcode::Encode, bitcode::Decode)]
struct PersistedEntry {
    /// Token the entry was written under; mismatch means stale.
    version_token: VersionToken,
    /// Write time in Unix milliseconds, for age-based invalidation.
    written_at_ms: i64,
    /// True when `payload` is gzip bytes rather than raw serialized records.
    compressed: bool,
    /// Serialized size before compression.
    original_size: u64,
    /// Serialized (possibly compressed) record rows.
    payload: Vec<u8>,
}

/// One row of the period index used for eviction scans.
#[derive(Clone, Debug, bitcode::Encode, bitcode::Decode)]
struct IndexEntry {
    period_id: PeriodId,
    written_at_ms: i64,
}

/// Versioned store-level metadata verified at open.
#[derive(Clone, Debug, bitcode::Encode, bitcode::Decode)]
struct StoreMeta {
    version: u8,
    scheme_tag: String,
}

/// Durable, versioned, compressed key/value cache for parsed period
/// datasets, backed by an append-only file store.
///
/// Every read validates the entry's version token and age; stale entries
/// are deleted on the spot and reported as misses. Read/write failures are
/// never fatal to callers: they degrade to a miss or a `false` result.
pub struct PeriodCache {
    store: DataStore,
    config: CacheConfig,
    dispatcher: Option<Arc<TaskDispatcher>>,
    token_provider: Arc<dyn Fn() -> VersionToken + Send + Sync>,
    fallback_transform: RecordTransform,
    index: Mutex<Vec<IndexEntry>>,
    #[cfg(test)]
    write_failures: std::sync::atomic::AtomicU32,
}

impl fmt::Debug for PeriodCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodCache")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

impl PeriodCache {
    /// Open (or create) a cache store at `path`.
    pub fn open<P: Into<PathBuf>>(path: P, config: CacheConfig) -> Result<Self, IngestError> {
        let path = coerce_store_path(path.into());
        ensure_parent_dir(&path)?;
        let store = DataStore::open(path.as_path()).map_err(map_store_err)?;
        let scheme_tag = if config.compress {
            COMPRESSION_TAG
        } else {
            PLAIN_TAG
        };
        let token_tag = scheme_tag.to_string();
        let cache = Self {
            store,
            config,
            dispatcher: None,
            token_provider: Arc::new(move || version_token(&daily_version(), &token_tag)),
            fallback_transform: passthrough_transform(),
            index: Mutex::new(Vec::new()),
            #[cfg(test)]
            write_failures: std::sync::atomic::AtomicU32::new(0),
        };
        cache.verify_metadata(scheme_tag)?;
        cache.load_index();
        Ok(cache)
    }

    /// Route compressed reads through this dispatcher when available.
    pub fn with_dispatcher(mut self, dispatcher: Arc<TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Override the current-version-token provider (test hook).
    pub fn with_token_provider(
        mut self,
        provider: Arc<dyn Fn() -> VersionToken + Send + Sync>,
    ) -> Self {
        self.token_provider = provider;
        self
    }

    /// Default cache-store file path under the crate's default directory.
    pub fn default_path() -> PathBuf {
        Self::default_path_in_dir(DEFAULT_STORE_DIR)
    }

    /// Default cache-store file path inside a custom directory.
    pub fn default_path_in_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
        dir.as_ref().join(DEFAULT_STORE_FILENAME)
    }

    /// Persist one period dataset. Failures degrade to `false`, never an
    /// error; a first write failure triggers one eviction-and-retry cycle.
    pub fn set(&self, dataset: &PeriodDataset) -> bool {
        let serialized = match serde_json::to_vec(&dataset.records) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(period_id = %dataset.period_id, error = %err, "cache serialization failed");
                return false;
            }
        };
        let original_size = serialized.len() as u64;
        let (payload, compressed) = if self.config.compress {
            match gzip_bytes(&serialized) {
                Ok(bytes) => (bytes, true),
                Err(err) => {
                    warn!(period_id = %dataset.period_id, error = %err, "compression failed; storing raw payload");
                    (serialized, false)
                }
            }
        } else {
            (serialized, false)
        };
        let entry = PersistedEntry {
            version_token: (self.token_provider)(),
            written_at_ms: Utc::now().timestamp_millis(),
            compressed,
            original_size,
            payload,
        };
        let encoded = encode_entry(&entry);
        let key = period_key(&dataset.period_id);

        match self.write_entry(&key, &encoded) {
            Ok(()) => {
                self.index_upsert(&dataset.period_id, entry.written_at_ms);
                debug!(
                    period_id = %dataset.period_id,
                    compressed,
                    compressed_size = encoded.len(),
                    original_size,
                    "cached period dataset"
                );
                true
            }
            Err(err) => {
                warn!(
                    period_id = %dataset.period_id,
                    error = %err,
                    "cache write failed; evicting aged entries and retrying"
                );
                self.clear_expired(self.config.retention);
                match self.write_entry(&key, &encoded) {
                    Ok(()) => {
                        self.index_upsert(&dataset.period_id, entry.written_at_ms);
                        true
                    }
                    Err(err) => {
                        warn!(
                            period_id = %dataset.period_id,
                            error = %err,
                            "cache write failed after eviction; giving up"
                        );
                        false
                    }
                }
            }
        }
    }

    /// Read one period dataset. Stale, corrupt, or unreadable entries
    /// degrade to a miss; stale entries are also deleted.
    pub fn get(&self, period_id: &str) -> Option<PeriodDataset> {
        match self.read_valid_entry(period_id) {
            Ok(Some(entry)) => match self.decode_entry_payload(period_id, entry) {
                Ok(records) => Some(PeriodDataset::new(period_id, records)),
                Err(err) => {
                    warn!(period_id, error = %err, "cached payload decode failed; treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(IngestError::StaleCache(_)) => {
                self.delete(period_id);
                None
            }
            Err(err) => {
                warn!(period_id, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Read several periods within one storage pass, then decode each key
    /// independently on its own thread. Keys that fail to decode are
    /// omitted; the batch itself never fails.
    pub fn get_batch(&self, period_ids: &[PeriodId]) -> HashMap<PeriodId, PeriodDataset> {
        let keys: Vec<Vec<u8>> = period_ids.iter().map(|id| period_key(id)).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(|key| key.as_slice()).collect();
        let entries = match self.store.batch_read(&key_refs) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "batch cache read failed");
                return HashMap::new();
            }
        };

        let mut raw: Vec<(PeriodId, Vec<u8>)> = Vec::new();
        for (period_id, entry) in period_ids.iter().zip(entries) {
            if let Some(handle) = entry {
                raw.push((period_id.clone(), handle.as_ref().to_vec()));
            }
        }

        let mut results = HashMap::new();
        let mut stale: Vec<PeriodId> = Vec::new();
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(raw.len());
            for (period_id, bytes) in &raw {
                handles.push((
                    period_id,
                    scope.spawn(move || self.decode_raw_entry(period_id, bytes)),
                ));
            }
            for (period_id, handle) in handles {
                match handle.join() {
                    Ok(Ok(Some(records))) => {
                        results.insert(period_id.clone(), PeriodDataset::new(period_id, records));
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(IngestError::StaleCache(_))) => stale.push(period_id.clone()),
                    Ok(Err(err)) => {
                        warn!(period_id = %period_id, error = %err, "batch entry decode failed; omitting");
                    }
                    Err(_) => {
                        warn!(period_id = %period_id, "batch entry decode panicked; omitting");
                    }
                }
            }
        });
        for period_id in stale {
            self.delete(&period_id);
        }
        results
    }

    /// Remove one period entry. The store is append-only, so deletion
    /// writes a tombstone record.
    pub fn delete(&self, period_id: &str) -> bool {
        let key = period_key(period_id);
        match self.store.write(&key, &[ENTRY_TOMBSTONE]) {
            Ok(_) => {
                self.index_remove(period_id);
                debug!(period_id, "cache entry deleted");
                true
            }
            Err(err) => {
                warn!(period_id, error = %err, "cache delete failed");
                false
            }
        }
    }

    /// Delete entries written longer than `max_age` ago. Returns how many
    /// entries were removed.
    pub fn clear_expired(&self, max_age: Duration) -> usize {
        let cutoff_ms = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let aged: Vec<PeriodId> = {
            let index = self.index.lock().expect("cache index poisoned");
            index
                .iter()
                .filter(|entry| entry.written_at_ms < cutoff_ms)
                .map(|entry| entry.period_id.clone())
                .collect()
        };
        for period_id in &aged {
            self.delete(period_id);
        }
        if !aged.is_empty() {
            debug!(removed = aged.len(), "expired cache entries cleared");
        }
        aged.len()
    }

    /// Delete every period entry and reset the index.
    pub fn clear_all(&self) -> usize {
        let all: Vec<PeriodId> = {
            let index = self.index.lock().expect("cache index poisoned");
            index.iter().map(|entry| entry.period_id.clone()).collect()
        };
        for period_id in &all {
            self.delete(period_id);
        }
        all.len()
    }

    /// Periods currently indexed, oldest first.
    pub fn period_ids(&self) -> Vec<PeriodId> {
        let index = self.index.lock().expect("cache index poisoned");
        index.iter().map(|entry| entry.period_id.clone()).collect()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.lock().expect("cache index poisoned").len()
    }

    /// True when no entries are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the persisted catalog "last updated" stamp.
    pub fn load_catalog_stamp(&self) -> Option<String> {
        match self.store.read(CATALOG_STAMP_KEY) {
            Ok(Some(handle)) => String::from_utf8(handle.as_ref().to_vec()).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "catalog stamp read failed");
                None
            }
        }
    }

    /// Persist the catalog "last updated" stamp.
    pub fn store_catalog_stamp(&self, stamp: &str) -> bool {
        match self.store.write(CATALOG_STAMP_KEY, stamp.as_bytes()) {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "catalog stamp write failed");
                false
            }
        }
    }

    fn verify_metadata(&self, scheme_tag: &str) -> Result<(), IngestError> {
        match self.store.read(META_KEY).map_err(map_store_err)? {
            Some(handle) => {
                let meta: StoreMeta = bitcode::decode(handle.as_ref()).map_err(|err| {
                    IngestError::CacheStore(format!("failed to decode store metadata: {err}"))
                })?;
                if meta.version != STORE_VERSION || meta.scheme_tag != scheme_tag {
                    warn!(
                        stored_version = meta.version,
                        stored_tag = %meta.scheme_tag,
                        current_tag = %scheme_tag,
                        "cache store metadata mismatch; invalidating all entries"
                    );
                    self.write_meta(scheme_tag)?;
                    self.persist_index(&[]);
                }
                Ok(())
            }
            None => self.write_meta(scheme_tag),
        }
    }

    fn write_meta(&self, scheme_tag: &str) -> Result<(), IngestError> {
        let meta = StoreMeta {
            version: STORE_VERSION,
            scheme_tag: scheme_tag.to_string(),
        };
        self.store
            .write(META_KEY, &bitcode::encode(&meta))
            .map_err(map_store_err)?;
        Ok(())
    }

    fn load_index(&self) {
        let entries = match self.store.read(INDEX_KEY) {
            Ok(Some(handle)) => match bitcode::decode::<Vec<IndexEntry>>(handle.as_ref()) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "cache index decode failed; starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "cache index read failed; starting empty");
                Vec::new()
            }
        };
        *self.index.lock().expect("cache index poisoned") = entries;
    }

    fn index_upsert(&self, period_id: &str, written_at_ms: i64) {
        let snapshot = {
            let mut index = self.index.lock().expect("cache index poisoned");
            index.retain(|entry| entry.period_id != period_id);
            index.push(IndexEntry {
                period_id: period_id.to_string(),
                written_at_ms,
            });
            index.clone()
        };
        self.persist_index(&snapshot);
    }

    fn index_remove(&self, period_id: &str) {
        let snapshot = {
            let mut index = self.index.lock().expect("cache index poisoned");
            let before = index.len();
            index.retain(|entry| entry.period_id != period_id);
            if index.len() == before {
                return;
            }
            index.clone()
        };
        self.persist_index(&snapshot);
    }

    fn persist_index(&self, entries: &[IndexEntry]) {
        if entries.is_empty() {
            self.index.lock().expect("cache index poisoned").clear();
        }
        if let Err(err) = self.store.write(INDEX_KEY, &bitcode::encode(&entries.to_vec())) {
            warn!(error = %err, "cache index write failed");
        }
    }

    fn write_entry(&self, key: &[u8], payload: &[u8]) -> Result<(), IngestError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self.write_failures.load(Ordering::SeqCst) > 0 {
                self.write_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(IngestError::QuotaExceeded(
                    "simulated storage quota failure".to_string(),
                ));
            }
        }
        self.store.write(key, payload).map_err(map_store_err)?;
        Ok(())
    }

    fn read_valid_entry(&self, period_id: &str) -> Result<Option<PersistedEntry>, IngestError> {
        let key = period_key(period_id);
        let Some(handle) = self.store.read(&key).map_err(map_store_err)? else {
            return Ok(None);
        };
        let Some(entry) = decode_entry(handle.as_ref())? else {
            return Ok(None);
        };
        self.validate_entry(period_id, &entry)?;
        Ok(Some(entry))
    }

    fn validate_entry(&self, period_id: &str, entry: &PersistedEntry) -> Result<(), IngestError> {
        let current = (self.token_provider)();
        if entry.version_token != current {
            debug!(
                period_id,
                stored = %entry.version_token,
                current = %current,
                "cache version token mismatch"
            );
            return Err(IngestError::StaleCache(period_id.to_string()));
        }
        let age_ms = Utc::now().timestamp_millis() - entry.written_at_ms;
        if age_ms > self.config.max_entry_age.as_millis() as i64 {
            debug!(period_id, age_ms, "cache entry over max age");
            return Err(IngestError::StaleCache(period_id.to_string()));
        }
        Ok(())
    }

    /// Decode one validated entry, routing through the dispatcher when one
    /// is attached.
    fn decode_entry_payload(
        &self,
        period_id: &str,
        entry: PersistedEntry,
    ) -> Result<Vec<Record>, IngestError> {
        let payload = TaskPayload::Bytes {
            period_id: period_id.to_string(),
            bytes: entry.payload,
        };
        let outcome = match self.dispatcher.as_ref() {
            Some(dispatcher) => dispatcher.run(TaskKind::DecompressAndParse, payload, None)?,
            None => run_task(
                TaskKind::DecompressAndParse,
                payload,
                &self.fallback_transform,
                None,
            )?,
        };
        match outcome {
            TaskOutcome::Records(records) => Ok(records),
            other => Err(IngestError::Configuration(format!(
                "unexpected cache decode outcome: {}",
                other.describe()
            ))),
        }
    }

    /// Validate and decode one raw entry on the caller's thread (the batch
    /// fan-out path).
    fn decode_raw_entry(
        &self,
        period_id: &str,
        bytes: &[u8],
    ) -> Result<Option<Vec<Record>>, IngestError> {
        let Some(entry) = decode_entry(bytes)? else {
            return Ok(None);
        };
        self.validate_entry(period_id, &entry)?;
        let outcome = run_task(
            TaskKind::DecompressAndParse,
            TaskPayload::Bytes {
                period_id: period_id.to_string(),
                bytes: entry.payload,
            },
            &self.fallback_transform,
            None,
        )?;
        match outcome {
            TaskOutcome::Records(records) => Ok(Some(records)),
            other => Err(IngestError::Configuration(format!(
                "unexpected cache decode outcome: {}",
                other.describe()
            ))),
        }
    }

    #[cfg(test)]
    fn fail_next_writes(&self, count: u32) {
        self.write_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

fn period_key(period_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(PERIOD_KEY_PREFIX.len() + period_id.len());
    key.extend_from_slice(PERIOD_KEY_PREFIX.as_bytes());
    key.extend_from_slice(period_id.as_bytes());
    key
}

fn encode_entry(entry: &PersistedEntry) -> Vec<u8> {
    let payload = bitcode::encode(entry);
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(ENTRY_RECORD_VERSION);
    buf.extend_from_slice(&payload);
    buf
}

fn decode_entry(bytes: &[u8]) -> Result<Option<PersistedEntry>, IngestError> {
    if bytes.is_empty() || bytes[0] == ENTRY_TOMBSTONE {
        return Ok(None);
    }
    if bytes[0] != ENTRY_RECORD_VERSION {
        return Err(IngestError::CacheStore(
            "cache entry record version mismatch".to_string(),
        ));
    }
    bitcode::decode(&bytes[1..])
        .map(Some)
        .map_err(|err| IngestError::CacheStore(format!("corrupt cache entry record: {err}")))
}

fn coerce_store_path(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        return path.join(DEFAULT_STORE_FILENAME);
    }
    path
}

fn ensure_parent_dir(path: &Path) -> Result<(), IngestError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(map_store_err)?;
    }
    Ok(())
}

fn map_store_err(err: io::Error) -> IngestError {
    IngestError::CacheStore(err.to_string())
}
