//! Compact payload encoding for chunk records.
//!
//! Extraction results and metadata snapshots are embedded in every
//! `chunks.jsonl` line as `base64(zstd(json))` strings. This keeps the log
//! one object per line and much smaller than inlining the JSON.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

const ZSTD_LEVEL: i32 = 3;

/// Serialize `value` to JSON, compress, and base64-encode.
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context("Failed to serialize payload")?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL).context("Failed to compress payload")?;
    Ok(STANDARD.encode(compressed))
}

/// Reverse of [`encode`].
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .context("Payload is not valid base64")?;
    let json = zstd::decode_all(compressed.as_slice()).context("Failed to decompress payload")?;
    serde_json::from_slice(&json).context("Payload is not valid JSON for the expected type")
}
