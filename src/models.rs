//! Core data models used throughout the pipeline.
//!
//! These types describe what flows between the extraction agent, the
//! document processor and the persisted per-document state. Field names are
//! serialized in camelCase so the on-disk files match the external tooling
//! that consumes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A subject–predicate–object statement extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Citation pointer into the source document, when one exists.
    #[serde(default)]
    pub source: Option<String>,
}

/// Structured output of one extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub global_context: Vec<String>,
    pub current_context: Vec<String>,
    pub facts: Vec<Fact>,
}

impl ExtractionResult {
    pub const MAX_GLOBAL_CONTEXT: usize = 3;
    pub const MAX_CURRENT_CONTEXT: usize = 2;
    pub const MIN_FACTS: usize = 3;
    pub const MAX_FACTS: usize = 10;

    /// Check the item-count bounds the response schema promises.
    pub fn check_bounds(&self) -> Result<(), String> {
        let g = self.global_context.len();
        let c = self.current_context.len();
        let f = self.facts.len();
        if !(1..=Self::MAX_GLOBAL_CONTEXT).contains(&g) {
            return Err(format!("globalContext has {} entries, expected 1..={}", g, Self::MAX_GLOBAL_CONTEXT));
        }
        if !(1..=Self::MAX_CURRENT_CONTEXT).contains(&c) {
            return Err(format!("currentContext has {} entries, expected 1..={}", c, Self::MAX_CURRENT_CONTEXT));
        }
        if !(Self::MIN_FACTS..=Self::MAX_FACTS).contains(&f) {
            return Err(format!("facts has {} entries, expected {}..={}", f, Self::MIN_FACTS, Self::MAX_FACTS));
        }
        Ok(())
    }
}

/// Narrative context carried between chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkContext {
    #[serde(default)]
    pub current: Vec<String>,
    #[serde(default)]
    pub last_five_global: Vec<String>,
}

/// Mutable per-chunk state owned by the document processor.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub chunk_id: String,
    pub cursor_position: u64,
    pub chunk_size: u64,
    pub context: ChunkContext,
    pub ts_start: i64,
    pub ts_end: i64,
}

/// Encoded payloads attached to a [`ChunkRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHashes {
    /// `encoder::encode` of the chunk's [`ExtractionResult`].
    pub extraction: String,
    /// `encoder::encode` of the [`ProcessMetadata`] snapshot at write time.
    pub process_metadata: String,
}

/// One line of `chunks.jsonl`. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    #[serde(flatten)]
    pub state: ProcessingState,
    pub hashes: ChunkHashes,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Processing,
    Completed,
}

/// Per-document run metadata, rewritten in place as processing advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetadata {
    pub process_id: String,
    pub filename: String,
    pub filepath: String,
    #[serde(default)]
    pub description: String,
    pub chunk_size_threshold: usize,
    pub file_size: u64,
    pub status: ProcessStatus,
    pub processed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Durable resume point: everything before it has been extracted.
    #[serde(default, alias = "characterPosition")]
    pub cursor_position: u64,
    #[serde(default)]
    pub total_chunks: u64,
    #[serde(default)]
    pub estimated_chunks: u64,
    #[serde(default)]
    pub current_context: Vec<String>,
}

/// Estimate how many chunks a file of `file_size` bytes will produce.
///
/// Chunks overshoot the threshold by up to a paragraph, so the estimate
/// pads the byte count by 20%.
pub fn estimate_chunks(file_size: u64, threshold: usize) -> u64 {
    let threshold = threshold.max(1) as f64;
    ((file_size as f64 * 1.2) / threshold).ceil().max(1.0) as u64
}
