//! Pure task implementations shared by the background worker context and the
//! synchronous fallback. Both paths call [`run_task`], so their output is
//! identical by construction.

use crate::data::{Record, parse_period_payload};
use crate::errors::IngestError;
use crate::types::{PeriodId, ProgressSink, RecordTransform};
use crate::utils::{gunzip_bytes, is_gzip, looks_like_markup};

/// Kind of offloadable work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Gzip-decompress payload bytes.
    Decompress,
    /// Parse already-decompressed structured text into records.
    ParseStructured,
    /// Sniff compression, decompress when needed, then parse.
    DecompressAndParse,
    /// Apply the per-record transform to a chunk of records.
    TransformChunk,
}

/// Input payload for one task.
#[derive(Clone, Debug)]
pub enum TaskPayload {
    /// Raw payload bytes tagged with the period they belong to.
    Bytes { period_id: PeriodId, bytes: Vec<u8> },
    /// Decompressed structured text tagged with its period.
    Text { period_id: PeriodId, text: String },
    /// Record rows for `TransformChunk`.
    Records(Vec<Record>),
}

impl TaskPayload {
    /// Short payload label for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TaskPayload::Bytes { .. } => "bytes",
            TaskPayload::Text { .. } => "text",
            TaskPayload::Records(_) => "records",
        }
    }
}

/// Output of one completed task.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// Decompressed bytes.
    Bytes(Vec<u8>),
    /// Parsed or transformed record rows.
    Records(Vec<Record>),
}

impl TaskOutcome {
    /// Short outcome label for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TaskOutcome::Bytes(_) => "bytes",
            TaskOutcome::Records(_) => "records",
        }
    }
}

/// Run one task synchronously in the calling context.
pub fn run_task(
    kind: TaskKind,
    payload: TaskPayload,
    transform: &RecordTransform,
    progress: Option<&ProgressSink>,
) -> Result<TaskOutcome, IngestError> {
    match (kind, payload) {
        (TaskKind::Decompress, TaskPayload::Bytes { period_id, bytes }) => {
            report(progress, 0.1, "decompressing payload");
            let out = decompress(&period_id, &bytes)?;
            report(progress, 0.5, "payload decompressed");
            Ok(TaskOutcome::Bytes(out))
        }
        (TaskKind::ParseStructured, TaskPayload::Text { period_id, text }) => {
            report(progress, 0.6, "parsing payload");
            let records = parse_text(&period_id, &text)?;
            report(progress, 0.9, "payload parsed");
            Ok(TaskOutcome::Records(records))
        }
        (TaskKind::DecompressAndParse, TaskPayload::Bytes { period_id, bytes }) => {
            report(progress, 0.1, "decompressing payload");
            let raw = if is_gzip(&bytes) {
                decompress(&period_id, &bytes)?
            } else {
                bytes
            };
            let text = decode_text(&period_id, raw)?;
            report(progress, 0.5, "parsing payload");
            let records = parse_text(&period_id, &text)?;
            report(progress, 0.9, "payload parsed");
            Ok(TaskOutcome::Records(records))
        }
        (TaskKind::TransformChunk, TaskPayload::Records(records)) => {
            report(progress, 0.1, "transforming records");
            let out = records.iter().map(|record| transform(record)).collect();
            report(progress, 0.9, "records transformed");
            Ok(TaskOutcome::Records(out))
        }
        (kind, payload) => Err(IngestError::Configuration(format!(
            "task kind {kind:?} cannot run on a {} payload",
            payload.describe()
        ))),
    }
}

/// Invoke a progress sink when one is attached.
pub(crate) fn report(progress: Option<&ProgressSink>, fraction: f64, message: &str) {
    if let Some(sink) = progress {
        sink(fraction, message);
    }
}

fn decompress(period_id: &str, bytes: &[u8]) -> Result<Vec<u8>, IngestError> {
    gunzip_bytes(bytes).map_err(|err| IngestError::Decompression {
        period_id: period_id.to_string(),
        reason: err.to_string(),
    })
}

fn decode_text(period_id: &str, bytes: Vec<u8>) -> Result<String, IngestError> {
    String::from_utf8(bytes).map_err(|err| IngestError::Parse {
        period_id: period_id.to_string(),
        reason: format!("payload is not valid UTF-8: {err}"),
    })
}

fn parse_text(period_id: &str, text: &str) -> Result<Vec<Record>, IngestError> {
    if looks_like_markup(text) {
        return Err(IngestError::Format {
            period_id: period_id.to_string(),
            reason: "body begins with a markup-document signature".to_string(),
        });
    }
    parse_period_payload(period_id, text)
}
