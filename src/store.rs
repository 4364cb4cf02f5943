//! Per-document persisted state.
//!
//! Each source document gets a directory named after the file (without its
//! extension), holding:
//!
//! - `metadata.json`: the [`ProcessMetadata`], rewritten after every chunk
//! - `chunks.jsonl`: one [`ChunkRecord`] per line, append-only
//!
//! Readers only ever scan `chunks.jsonl` forward and tolerate a torn last
//! line, so a reader running next to an active writer sees a clean prefix.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::{ChunkRecord, ProcessMetadata};

pub const METADATA_FILE: &str = "metadata.json";
pub const CHUNKS_FILE: &str = "chunks.jsonl";

/// Chunk records scanned when rebuilding global context on resume.
const CONTEXT_SCAN_RECORDS: usize = 10;
/// Global context entries restored on resume.
const RESTORED_GLOBAL_CONTEXT: usize = 5;

#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    /// Store for `source`. With no `output_root` the state directory sits
    /// next to the source file.
    pub fn for_source(source: &Path, output_root: Option<&Path>) -> Self {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let parent = match output_root {
            Some(root) => root.to_path_buf(),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Self {
            dir: parent.join(stem),
        }
    }

    /// Store rooted at an existing state directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn chunks_path(&self) -> PathBuf {
        self.dir.join(CHUNKS_FILE)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory: {}", self.dir.display()))
    }

    /// Create the directory and truncate the chunk log for a fresh run.
    pub fn prepare_fresh(&self) -> Result<()> {
        self.ensure_dir()?;
        fs::write(self.chunks_path(), b"")
            .with_context(|| format!("Failed to reset {}", self.chunks_path().display()))
    }

    pub fn load_metadata(&self) -> Result<Option<ProcessMetadata>> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let metadata = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(metadata))
    }

    /// Write metadata via a temp file and rename, so a crash never leaves a
    /// half-written `metadata.json`.
    pub fn save_metadata(&self, metadata: &ProcessMetadata) -> Result<()> {
        let path = self.metadata_path();
        let tmp = self.dir.join(format!("{}.tmp", METADATA_FILE));
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))
    }

    /// Append one record as a single line and sync it to disk.
    pub fn append_chunk(&self, record: &ChunkRecord) -> Result<()> {
        let path = self.chunks_path();
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("Failed to sync {}", path.display()))
    }

    pub fn read_chunks(&self) -> Result<Vec<ChunkRecord>> {
        read_chunk_log(&self.chunks_path())
    }

    /// Persisted resume position, or 0 when nothing has been recorded.
    pub fn resume_position(&self) -> Result<u64> {
        Ok(self
            .load_metadata()?
            .map(|m| m.cursor_position)
            .unwrap_or(0))
    }

    /// Rebuild the global-context tail from the newest chunk records.
    ///
    /// Unions the `lastFiveGlobal` lists of the last few records in log
    /// order, keeps the first occurrence of each entry, and returns the
    /// newest five.
    pub fn existing_global_context(&self) -> Result<Vec<String>> {
        let path = self.chunks_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut recent: VecDeque<ChunkRecord> = VecDeque::with_capacity(CONTEXT_SCAN_RECORDS);
        for record in read_chunk_log(&path)? {
            if recent.len() == CONTEXT_SCAN_RECORDS {
                recent.pop_front();
            }
            recent.push_back(record);
        }

        let mut merged: Vec<String> = Vec::new();
        for record in &recent {
            for entry in &record.state.context.last_five_global {
                if !merged.contains(entry) {
                    merged.push(entry.clone());
                }
            }
        }
        let skip = merged.len().saturating_sub(RESTORED_GLOBAL_CONTEXT);
        Ok(merged.split_off(skip))
    }
}

/// Read a chunk log, skipping lines that do not parse.
///
/// A missing file reads as empty.
pub fn read_chunk_log(path: &Path) -> Result<Vec<ChunkRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChunkRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), line = i + 1, error = %e, "skipping malformed chunk record"),
        }
    }
    Ok(records)
}
