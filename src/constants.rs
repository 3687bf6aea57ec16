/// Constants used by the durable period cache and its persisted layout.
pub mod cache {
    /// Key prefix for persisted period datasets.
    pub const PERIOD_KEY_PREFIX: &str = "periodData-";
    /// Key for store-level metadata (store version plus compression tag).
    pub const META_KEY: &[u8] = b"__meta__";
    /// Key for the period index record used by eviction scans.
    pub const INDEX_KEY: &[u8] = b"__index__";
    /// Key for the persisted catalog "last updated" stamp.
    pub const CATALOG_STAMP_KEY: &[u8] = b"__catalog_stamp__";
    /// Version tag for persisted entry envelopes.
    pub const ENTRY_RECORD_VERSION: u8 = 1;
    /// Version tag for store metadata compatibility checks.
    pub const STORE_VERSION: u8 = 1;
    /// Tombstone marker byte for deleted entries (the store is append-only).
    pub const ENTRY_TOMBSTONE: u8 = b'-';
    /// Compression-scheme tag mixed into version tokens when gzip is on.
    pub const COMPRESSION_TAG: &str = "gz1";
    /// Scheme tag used when compression is disabled.
    pub const PLAIN_TAG: &str = "raw";
    /// Maximum entry age before a read treats it as a miss (24 hours).
    pub const MAX_ENTRY_AGE_HOURS: i64 = 24;
    /// Retention window for quota-pressure eviction (7 days).
    pub const RETENTION_DAYS: i64 = 7;
    /// Default directory for the persisted cache store.
    pub const DEFAULT_STORE_DIR: &str = ".almanac_cache";
    /// Default filename for the persisted cache store.
    pub const DEFAULT_STORE_FILENAME: &str = "period_cache.bin";
}

/// Constants used by the background task dispatcher.
pub mod dispatcher {
    /// Seconds to wait for the worker readiness announcement.
    pub const READY_TIMEOUT_SECS: u64 = 5;
    /// Seconds allowed per task before the worker context is torn down.
    pub const TASK_TIMEOUT_SECS: u64 = 30;
}

/// Constants used by the chunked processor.
pub mod processor {
    /// Default records per chunk.
    pub const DEFAULT_CHUNK_SIZE: usize = 3000;
    /// Chunks processed concurrently per batch.
    pub const MAX_CONCURRENT_CHUNKS: usize = 3;
    /// Dataset size above which chunk transforms route through the dispatcher.
    pub const OFFLOAD_THRESHOLD: usize = 10_000;
}

/// Constants used by lazy view snapshots.
pub mod views {
    /// Maximum snapshot age before re-derivation (5 minutes).
    pub const MAX_SNAPSHOT_AGE_SECS: u64 = 300;
}

/// Constants used by network retrieval and payload sniffing.
pub mod retrieval {
    /// Gzip magic signature checked on the first two payload bytes.
    pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
    /// Signatures marking a markup error page served in place of data.
    pub const MARKUP_SIGNATURES: [&str; 3] = ["<!DOCTYPE", "<html", "<HTML"];
    /// Period dataset file name prefix.
    pub const DATASET_FILE_PREFIX: &str = "data-";
    /// Period dataset file name suffix.
    pub const DATASET_FILE_SUFFIX: &str = ".json.gz";
    /// Catalog metadata file name.
    pub const CATALOG_FILE: &str = "data-metadata.json";
    /// Field carrying record rows in a period payload object.
    pub const DETAILS_FIELD: &str = "details";
    /// Record field used to attribute a record to a period.
    pub const DATE_FIELD: &str = "date";
    /// Catalog field listing available periods.
    pub const CATALOG_PERIODS_FIELD: &str = "years";
    /// Catalog field carrying the coarse last-updated stamp.
    pub const CATALOG_UPDATED_FIELD: &str = "last_update";
}
