use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::constants::retrieval::{
    CATALOG_FILE, CATALOG_PERIODS_FIELD, CATALOG_UPDATED_FIELD, DATASET_FILE_PREFIX,
    DATASET_FILE_SUFFIX,
};
use crate::errors::IngestError;
use crate::types::PeriodId;
use crate::utils::{daily_version, hourly_version};

/// Catalog of available periods plus a coarse freshness stamp.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    /// Periods the server offers.
    pub periods: Vec<PeriodId>,
    /// Coarse "last updated" stamp used to decide forced reloads.
    pub last_update: Option<String>,
    /// True when previously cached periods must be reloaded. Set by the
    /// load pipeline after comparing stamps; fetchers leave it `false`.
    pub needs_reload: bool,
}

/// Retrieval interface for period payloads and the companion catalog.
///
/// One retrieval per period dataset; payloads may be gzip-compressed and
/// are sniffed downstream, never here.
pub trait PeriodFetcher: Send + Sync {
    /// Fetch the raw (possibly compressed) payload for one period.
    fn fetch_period(&self, period_id: &str) -> Result<Vec<u8>, IngestError>;
    /// Fetch the catalog of available periods.
    fn fetch_catalog(&self) -> Result<Catalog, IngestError>;
}

impl<T: PeriodFetcher + ?Sized> PeriodFetcher for std::sync::Arc<T> {
    fn fetch_period(&self, period_id: &str) -> Result<Vec<u8>, IngestError> {
        (**self).fetch_period(period_id)
    }

    fn fetch_catalog(&self) -> Result<Catalog, IngestError> {
        (**self).fetch_catalog()
    }
}

/// HTTP fetcher addressing per-period files under a base URL with
/// cache-busting version query parameters.
pub struct HttpPeriodFetcher {
    base_url: String,
}

impl HttpPeriodFetcher {
    /// Fetcher rooted at `base_url` (trailing slashes are trimmed).
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url: String = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    fn period_url(&self, period_id: &str) -> String {
        format!(
            "{}/{}{}{}?v={}",
            self.base_url,
            DATASET_FILE_PREFIX,
            period_id,
            DATASET_FILE_SUFFIX,
            daily_version()
        )
    }

    fn catalog_url(&self) -> String {
        format!("{}/{}?v={}", self.base_url, CATALOG_FILE, hourly_version())
    }
}

impl PeriodFetcher for HttpPeriodFetcher {
    fn fetch_period(&self, period_id: &str) -> Result<Vec<u8>, IngestError> {
        let url = self.period_url(period_id);
        debug!(period_id, url = %url, "retrieving period payload");
        let response = ureq::get(&url)
            .call()
            .map_err(|err| IngestError::Retrieval {
                period_id: period_id.to_string(),
                reason: err.to_string(),
            })?;
        response
            .into_body()
            .read_to_vec()
            .map_err(|err| IngestError::Retrieval {
                period_id: period_id.to_string(),
                reason: format!("failed reading response body: {err}"),
            })
    }

    fn fetch_catalog(&self) -> Result<Catalog, IngestError> {
        let url = self.catalog_url();
        info!(url = %url, "retrieving period catalog");
        let response = ureq::get(&url)
            .call()
            .map_err(|err| IngestError::Retrieval {
                period_id: "catalog".to_string(),
                reason: err.to_string(),
            })?;
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|err| IngestError::Retrieval {
                period_id: "catalog".to_string(),
                reason: format!("failed reading response body: {err}"),
            })?;
        parse_catalog(&body)
    }
}

/// Parse catalog metadata (`{"years": [...], "last_update": "..."}`).
///
/// Period entries may be strings or bare numbers. A catalog listing no
/// periods is an error: there is nothing the pipeline could load.
pub fn parse_catalog(body: &str) -> Result<Catalog, IngestError> {
    let value: Value = serde_json::from_str(body).map_err(|err| IngestError::Parse {
        period_id: "catalog".to_string(),
        reason: err.to_string(),
    })?;
    let periods: Vec<PeriodId> = value
        .get(CATALOG_PERIODS_FIELD)
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| match row {
                    Value::String(period) => Some(period.clone()),
                    Value::Number(period) => Some(period.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if periods.is_empty() {
        return Err(IngestError::Parse {
            period_id: "catalog".to_string(),
            reason: "catalog lists no periods".to_string(),
        });
    }
    let last_update = value
        .get(CATALOG_UPDATED_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Catalog {
        periods,
        last_update,
        needs_reload: false,
    })
}

/// In-memory fetcher for tests and offline runs.
///
/// Payloads are served verbatim; failures can be scripted per period and
/// are consumed in order, after which the static payload serves again.
#[derive(Default)]
pub struct InMemoryPeriodFetcher {
    payloads: HashMap<PeriodId, Vec<u8>>,
    catalog: Catalog,
    delays: HashMap<PeriodId, Duration>,
    scripted_failures: Mutex<HashMap<PeriodId, Vec<IngestError>>>,
    fetches: AtomicUsize,
}

impl InMemoryPeriodFetcher {
    /// Empty fetcher; populate with the builder methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `payload` for `period_id`.
    pub fn with_period(mut self, period_id: &str, payload: Vec<u8>) -> Self {
        self.payloads.insert(period_id.to_string(), payload);
        if !self.catalog.periods.iter().any(|id| id == period_id) {
            self.catalog.periods.push(period_id.to_string());
        }
        self
    }

    /// Serve this catalog instead of one derived from registered periods.
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Delay every `fetch_period` call for `period_id` (completion-order tests).
    pub fn with_delay(mut self, period_id: &str, delay: Duration) -> Self {
        self.delays.insert(period_id.to_string(), delay);
        self
    }

    /// Queue one scripted failure for `period_id`; consumed before the
    /// static payload is served.
    pub fn with_scripted_failure(self, period_id: &str, error: IngestError) -> Self {
        self.scripted_failures
            .lock()
            .expect("scripted failures poisoned")
            .entry(period_id.to_string())
            .or_default()
            .push(error);
        self
    }

    /// Number of `fetch_period` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl PeriodFetcher for InMemoryPeriodFetcher {
    fn fetch_period(&self, period_id: &str) -> Result<Vec<u8>, IngestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(period_id) {
            std::thread::sleep(*delay);
        }
        {
            let mut scripted = self
                .scripted_failures
                .lock()
                .expect("scripted failures poisoned");
            if let Some(queue) = scripted.get_mut(period_id)
                && !queue.is_empty()
            {
                return Err(queue.remove(0));
            }
        }
        self.payloads
            .get(period_id)
            .cloned()
            .ok_or_else(|| IngestError::Retrieval {
                period_id: period_id.to_string(),
                reason: "period not registered".to_string(),
            })
    }

    fn fetch_catalog(&self) -> Result<Catalog, IngestError> {
        if self.catalog.periods.is_empty() {
            return Err(IngestError::Parse {
                period_id: "catalog".to_string(),
                reason: "catalog lists no periods".to_string(),
            });
        }
        Ok(self.catalog.clone())
    }
}
