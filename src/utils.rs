use std::io::{Read, Write};

use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::constants::retrieval::{GZIP_MAGIC, MARKUP_SIGNATURES};

/// Calendar-day version stamp (`YYYYMMDD`) used for period retrieval and
/// cache version tokens.
pub fn daily_version() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

/// Hourly version stamp (`YYYYMMDDHH`) used for catalog retrieval.
pub fn hourly_version() -> String {
    Utc::now().format("%Y%m%d%H").to_string()
}

/// Compose a cache version token from a day stamp and a scheme tag.
///
/// Changing either the calendar day or the compression scheme invalidates
/// every existing entry without a schema migration.
pub fn version_token(day_stamp: &str, scheme_tag: &str) -> String {
    format!("{day_stamp}-{scheme_tag}")
}

/// True if the payload starts with the gzip magic signature.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC
}

/// True if the text begins with a markup-document signature, meaning the
/// server answered with an error page in place of data.
pub fn looks_like_markup(text: &str) -> bool {
    let trimmed = text.trim_start();
    MARKUP_SIGNATURES
        .iter()
        .any(|signature| trimmed.starts_with(signature))
}

/// Gzip-compress a byte slice.
pub fn gzip_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Gzip-decompress a byte slice.
pub fn gunzip_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
