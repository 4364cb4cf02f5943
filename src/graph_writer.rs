//! Replay persisted chunk logs into the knowledge graph.
//!
//! Reads a document's `chunks.jsonl` (never writing to it), rebuilds one
//! episode per chunk record and delivers it through [`GraphitiClient`].
//!
//! - [`GraphWriter`]: fixed-size batches with a short pause between batches,
//!   fire-and-forget delivery.
//! - [`GraphRunner`]: bounded-concurrency queue (default 1, strictly ordered)
//!   using the blocking send, with a fixed delay after every send so the
//!   downstream service never sees bursts. Failures are attributed per chunk.
//!
//! Both can resume from a given chunk id.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{Config, GraphitiConfig};
use crate::encoder;
use crate::graphiti::{DetachedSender, GraphitiClient, GraphitiEpisode, GraphitiSettings};
use crate::models::{ChunkRecord, ExtractionResult, ProcessMetadata};
use crate::store::{self, CHUNKS_FILE};

/// Facts listed by name in an episode summary.
const SUMMARY_KEY_FACTS: usize = 3;
/// Pause between documents when replaying a directory.
const DOCUMENT_PAUSE: Duration = Duration::from_secs(1);
/// How long fire-and-forget delivery may keep running after the last send.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

// ============ Chunk log reader ============

/// In-memory cursor over a chunk log.
pub struct ChunkReader {
    path: PathBuf,
    records: Vec<ChunkRecord>,
    index: usize,
}

impl ChunkReader {
    /// Load the entire log. Malformed lines are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let records = store::read_chunk_log(path)?;
        Ok(Self::from_records(path, records))
    }

    pub fn from_records(path: &Path, records: Vec<ChunkRecord>) -> Self {
        Self {
            path: path.to_path_buf(),
            records,
            index: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_record(&mut self) -> Option<&ChunkRecord> {
        let record = self.records.get(self.index)?;
        self.index += 1;
        Some(record)
    }

    pub fn remaining(&self) -> usize {
        self.records.len() - self.index
    }

    /// `(consumed, total)`.
    pub fn progress(&self) -> (usize, usize) {
        (self.index, self.records.len())
    }

    /// Position the reader so the next record is `chunk_id`.
    pub fn seek_to_chunk(&mut self, chunk_id: &str) -> Result<()> {
        match self.records.iter().position(|r| r.state.chunk_id == chunk_id) {
            Some(i) => {
                self.index = i;
                Ok(())
            }
            None => bail!("Chunk {} not found in {}", chunk_id, self.path.display()),
        }
    }

    pub fn get_chunk_by_id(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.records.iter().find(|r| r.state.chunk_id == chunk_id)
    }
}

// ============ Episode construction ============

/// Name and description shared by every episode of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub name: String,
    pub description: String,
}

impl DocumentInfo {
    /// Derive from a chunk log: the name is the state directory's name,
    /// the description comes from the first decodable metadata snapshot.
    pub fn for_log(path: &Path, records: &[ChunkRecord]) -> Self {
        let name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let description = records
            .iter()
            .find_map(|r| encoder::decode::<ProcessMetadata>(&r.hashes.process_metadata).ok())
            .map(|m| m.description)
            .unwrap_or_default();
        Self { name, description }
    }
}

/// Build the episode for one chunk record.
///
/// The result depends only on `record` and `doc`, so replaying the same log
/// twice yields byte-identical payloads.
pub fn build_episode(record: &ChunkRecord, doc: &DocumentInfo) -> Result<GraphitiEpisode> {
    let state = &record.state;
    let extraction: ExtractionResult = encoder::decode(&record.hashes.extraction)
        .with_context(|| format!("chunk {}: bad extraction payload", state.chunk_id))?;
    let metadata: ProcessMetadata = encoder::decode(&record.hashes.process_metadata)
        .with_context(|| format!("chunk {}: bad metadata payload", state.chunk_id))?;
    let duration_ms = (state.ts_end - state.ts_start).max(0);

    let mut content = serde_json::json!({
        "summary": summary_text(record, &extraction, doc, duration_ms),
        "chunkId": state.chunk_id,
        "document": {
            "name": doc.name,
            "description": doc.description,
        },
        "extraction": serde_yaml::to_string(&extraction)?,
        "processMetadata": serde_yaml::to_string(&metadata)?,
        "context": serde_yaml::to_string(&state.context)?,
        "chunkInfo": {
            "cursorPosition": state.cursor_position,
            "chunkSize": state.chunk_size,
            "processingDuration": duration_ms,
            "processedAt": record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
    });
    let digest = hex::encode(Sha256::digest(serde_json::to_vec(&content)?));
    content["contentDigest"] = serde_json::Value::String(digest);

    let description = if doc.description.is_empty() {
        format!("Facts extracted from {}", doc.name)
    } else {
        doc.description.clone()
    };

    Ok(GraphitiEpisode {
        content,
        name: format!("{}_chunk_{}", doc.name, state.chunk_id),
        description,
        reference_time: millis_to_rfc3339(state.ts_start),
    })
}

fn summary_text(
    record: &ChunkRecord,
    extraction: &ExtractionResult,
    doc: &DocumentInfo,
    duration_ms: i64,
) -> String {
    let state = &record.state;
    let mut lines = vec![
        format!("Chunk ID: {}", state.chunk_id),
        format!("Document: {}", doc.name),
        format!("Facts Extracted: {}", extraction.facts.len()),
        format!("Position: {} ({} chars)", state.cursor_position, state.chunk_size),
        format!("Processing Time: {}ms", duration_ms),
        format!("Global Context: {}", state.context.last_five_global.join("; ")),
        format!("Current Context: {}", state.context.current.join("; ")),
        String::new(),
        "Key Facts:".to_string(),
    ];
    for fact in extraction.facts.iter().take(SUMMARY_KEY_FACTS) {
        lines.push(format!("- {} {} {}", fact.subject, fact.predicate, fact.object));
    }
    if extraction.facts.len() > SUMMARY_KEY_FACTS {
        lines.push(format!(
            "... and {} more facts",
            extraction.facts.len() - SUMMARY_KEY_FACTS
        ));
    }
    lines.join("\n")
}

fn millis_to_rfc3339(ms: i64) -> String {
    let ts: DateTime<Utc> = Utc.timestamp_millis_opt(ms).single().unwrap_or_default();
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============ Writers ============

/// Summary of one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphWriteResult {
    pub chunks_processed: usize,
    pub episodes_sent: usize,
    pub errors: Vec<String>,
}

impl GraphWriteResult {
    fn absorb(&mut self, other: GraphWriteResult) {
        self.chunks_processed += other.chunks_processed;
        self.episodes_sent += other.episodes_sent;
        self.errors.extend(other.errors);
    }
}

/// Batch replay with fire-and-forget delivery.
pub struct GraphWriter {
    client: Arc<GraphitiClient>,
    batch_size: usize,
    batch_delay: Duration,
}

impl GraphWriter {
    pub fn new(client: Arc<GraphitiClient>, config: &GraphitiConfig) -> Self {
        Self {
            client,
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        }
    }

    /// Replay every remaining record. Fails only if the service is down.
    pub async fn process_chunks(
        &self,
        reader: &mut ChunkReader,
        doc: &DocumentInfo,
    ) -> Result<GraphWriteResult> {
        if !self.client.is_available().await {
            bail!("Graph service at {} is not available", self.client.base_url());
        }

        let sender = DetachedSender::new(self.client.clone());
        let mut result = GraphWriteResult::default();

        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match reader.next_record() {
                    Some(record) => batch.push(record.clone()),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            for record in &batch {
                result.chunks_processed += 1;
                match build_episode(record, doc) {
                    Ok(episode) => sender.send(episode),
                    Err(e) => result.errors.push(format!("{:#}", e)),
                }
            }
            let (done, total) = reader.progress();
            info!(document = %doc.name, done, total, "dispatched batch");

            if reader.remaining() > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        let report = sender.drain(DRAIN_TIMEOUT).await;
        result.episodes_sent = report.delivered;
        for failure in report.failures {
            result.errors.push(format!("{}: {}", failure.episode, failure.error));
        }
        if report.abandoned > 0 {
            result
                .errors
                .push(format!("{} deliveries still pending at shutdown", report.abandoned));
        }
        Ok(result)
    }

    pub async fn process_chunks_from(
        &self,
        reader: &mut ChunkReader,
        chunk_id: &str,
        doc: &DocumentInfo,
    ) -> Result<GraphWriteResult> {
        reader.seek_to_chunk(chunk_id)?;
        self.process_chunks(reader, doc).await
    }
}

/// Ordered, rate-limited replay with per-chunk error attribution.
pub struct GraphRunner {
    client: Arc<GraphitiClient>,
    concurrency: usize,
    delay: Duration,
}

impl GraphRunner {
    pub fn new(client: Arc<GraphitiClient>, config: &GraphitiConfig) -> Self {
        Self {
            client,
            concurrency: config.concurrency.max(1),
            delay: Duration::from_millis(config.delay_between_chunks_ms),
        }
    }

    pub async fn run(&self, reader: &mut ChunkReader, doc: &DocumentInfo) -> GraphWriteResult {
        if !self.client.is_available().await {
            warn!(url = %self.client.base_url(), "graph service not reachable, attempting delivery anyway");
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut result = GraphWriteResult::default();

        while let Some(record) = reader.next_record() {
            result.chunks_processed += 1;
            let chunk_id = record.state.chunk_id.clone();
            let episode = match build_episode(record, doc) {
                Ok(episode) => episode,
                Err(e) => {
                    result.errors.push(format!("{:#}", e));
                    continue;
                }
            };

            // Acquire before spawning so sends start in log order.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let client = self.client.clone();
            let delay = self.delay;
            tasks.spawn(async move {
                let resp = client.send_episode(&episode).await;
                tokio::time::sleep(delay).await;
                drop(permit);
                (chunk_id, resp)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, resp)) if resp.success => result.episodes_sent += 1,
                Ok((chunk_id, resp)) => result.errors.push(format!(
                    "chunk {}: {}",
                    chunk_id,
                    resp.error.unwrap_or_else(|| "unknown error".into())
                )),
                Err(e) => result.errors.push(format!("delivery task failed: {}", e)),
            }
        }
        result
    }

    pub async fn run_from(
        &self,
        reader: &mut ChunkReader,
        chunk_id: &str,
        doc: &DocumentInfo,
    ) -> Result<GraphWriteResult> {
        reader.seek_to_chunk(chunk_id)?;
        Ok(self.run(reader, doc).await)
    }
}

// ============ `facts graph` command ============

/// Every `chunks.jsonl` under `path` (or `path` itself), sorted.
pub fn discover_chunk_logs(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut logs: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == CHUNKS_FILE)
        .map(|e| e.into_path())
        .collect();
    logs.sort();
    logs
}

/// Replay every chunk log under `path`.
///
/// With `from_chunk`, logs before the one containing that chunk are
/// skipped and that log resumes at the chunk.
pub async fn run_graph(
    cfg: &Config,
    path: &Path,
    from_chunk: Option<&str>,
    fire_and_forget: bool,
) -> Result<GraphWriteResult> {
    let logs = discover_chunk_logs(path);
    if logs.is_empty() {
        bail!("No {} found under {}", CHUNKS_FILE, path.display());
    }

    let client = Arc::new(GraphitiClient::new(GraphitiSettings::from_config(&cfg.graphiti))?);
    let writer = GraphWriter::new(client.clone(), &cfg.graphiti);
    let runner = GraphRunner::new(client, &cfg.graphiti);

    let mut readers = Vec::with_capacity(logs.len());
    for log in &logs {
        readers.push(ChunkReader::load(log)?);
    }
    let mut start = 0;
    if let Some(id) = from_chunk {
        start = readers
            .iter()
            .position(|r| r.get_chunk_by_id(id).is_some())
            .with_context(|| format!("Chunk {} not found under {}", id, path.display()))?;
        readers[start].seek_to_chunk(id)?;
    }

    let mut total = GraphWriteResult::default();
    for (i, reader) in readers.iter_mut().enumerate().skip(start) {
        if i > start {
            tokio::time::sleep(DOCUMENT_PAUSE).await;
        }
        let doc = DocumentInfo::for_log(reader.path(), &reader.records);
        println!("graph {}  ({} chunks)", doc.name, reader.remaining());

        let result = if fire_and_forget {
            match writer.process_chunks(reader, &doc).await {
                Ok(r) => r,
                Err(e) => GraphWriteResult {
                    errors: vec![format!("{}: {:#}", doc.name, e)],
                    ..Default::default()
                },
            }
        } else {
            runner.run(reader, &doc).await
        };

        println!(
            "  processed: {}  sent: {}  errors: {}",
            result.chunks_processed,
            result.episodes_sent,
            result.errors.len()
        );
        for err in &result.errors {
            println!("    {}", err);
        }
        total.absorb(result);
    }

    println!(
        "graph done  documents: {}  chunks: {}  episodes: {}  errors: {}",
        readers.len() - start,
        total.chunks_processed,
        total.episodes_sent,
        total.errors.len()
    );
    Ok(total)
}
