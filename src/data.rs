use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::constants::retrieval::{DATE_FIELD, DETAILS_FIELD};
use crate::errors::IngestError;
use crate::types::{PeriodId, RecordTransform};

/// Schema-free record: a flat map of string keys to JSON values.
///
/// The pipeline treats records as uninterpreted units; the only field it
/// inspects is the date used to attribute a record to its period.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    /// Raw field map as parsed from the period payload.
    pub fields: Map<String, Value>,
}

impl Record {
    /// Wrap a parsed field map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builder used heavily by tests and fixtures.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// String field accessor.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Period this record belongs to, derived from its date field prefix
    /// (`"2024-03-17"` belongs to period `2024`).
    pub fn period(&self) -> Option<&str> {
        self.get_str(DATE_FIELD)
            .map(|date| date.split('-').next().unwrap_or(date))
    }
}

/// Parsed dataset for one period.
///
/// Immutable once produced; a forced reload replaces it wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodDataset {
    /// Period the records were retrieved for.
    pub period_id: PeriodId,
    /// Parsed record rows in payload order.
    pub records: Vec<Record>,
}

impl PeriodDataset {
    /// Build a dataset from parsed records.
    pub fn new(period_id: impl Into<PeriodId>, records: Vec<Record>) -> Self {
        Self {
            period_id: period_id.into(),
            records,
        }
    }

    /// Number of records in this period.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the period produced no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse a period payload into record rows.
///
/// Accepts the wire shape `{"details": [...]}` as well as a bare top-level
/// array of record objects.
pub fn parse_period_payload(period_id: &str, text: &str) -> Result<Vec<Record>, IngestError> {
    let value: Value = serde_json::from_str(text).map_err(|err| IngestError::Parse {
        period_id: period_id.to_string(),
        reason: err.to_string(),
    })?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove(DETAILS_FIELD) {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(IngestError::Parse {
                    period_id: period_id.to_string(),
                    reason: format!("payload object has no '{DETAILS_FIELD}' array"),
                });
            }
        },
        _ => {
            return Err(IngestError::Parse {
                period_id: period_id.to_string(),
                reason: "payload is neither an object nor an array".to_string(),
            });
        }
    };
    rows.into_iter()
        .map(|row| match row {
            Value::Object(fields) => Ok(Record { fields }),
            other => Err(IngestError::Parse {
                period_id: period_id.to_string(),
                reason: format!("record row is not an object: {other}"),
            }),
        })
        .collect()
}

/// Stock per-record transform: passthrough.
///
/// The pipeline keeps a per-record transform stage between parse and merge;
/// the default leaves records unchanged.
pub fn passthrough_transform() -> RecordTransform {
    Arc::new(|record: &Record| record.clone())
}
