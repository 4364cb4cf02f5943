//! Per-document processing state machine.
//!
//! ```text
//! Uninitialized ──start()──▶ Processing ──finalize()──▶ Completed
//!                               │
//!                               └── chunk error ──▶ Aborted
//! ```
//!
//! [`DocumentProcessor`] is the single writer of a document's persisted
//! state. For each chunk it arms the stall watchdog, calls the extraction
//! agent, appends a [`ChunkRecord`] to the log and advances the durable
//! cursor in `metadata.json`. On a chunk error the cursor is saved at the
//! start of the failed chunk before the error is returned, so a restart
//! always resumes exactly there.

use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{ExtractionAgent, ExtractionError};
use crate::chunk::StreamChunk;
use crate::encoder;
use crate::graph_writer::{build_episode, DocumentInfo};
use crate::graphiti::{DetachedSender, DrainReport, GraphitiClient};
use crate::models::{
    estimate_chunks, ChunkContext, ChunkHashes, ChunkRecord, Fact, ProcessMetadata, ProcessStatus,
    ProcessingState,
};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::DocumentStore;
use crate::watchdog::Watchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Processing,
    Completed,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("processor is {actual:?}, expected {expected:?}")]
    InvalidPhase { actual: Phase, expected: Phase },
    #[error("{source} (resume from position {cursor_position})")]
    Extraction {
        cursor_position: u64,
        #[source]
        source: ExtractionError,
    },
    #[error("failed to persist state: {0}")]
    Persist(String),
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Extraction { source, .. } if source.is_timeout())
    }
}

fn persist(e: anyhow::Error) -> ProcessError {
    ProcessError::Persist(format!("{:#}", e))
}

/// Settings for one document run.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub source: PathBuf,
    pub description: String,
    pub threshold: usize,
    /// `0` starts fresh; anything else resumes.
    pub resume_from: u64,
}

/// What one successful chunk produced.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub record: ChunkRecord,
    pub facts: Vec<Fact>,
    pub new_global_context: Vec<String>,
}

/// Bounded window of recently seen global-context entries, compared by
/// value. Used to tell newly produced entries from ones already persisted.
///
/// An entry that legitimately repeats while its earlier copy is still in
/// the window is reported as already seen.
#[derive(Debug, Clone)]
pub struct ContextTail {
    seen: VecDeque<String>,
    capacity: usize,
}

impl ContextTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `snapshot`, returning the entries not already in the window.
    pub fn record(&mut self, snapshot: &[String]) -> Vec<String> {
        let mut fresh = Vec::new();
        for entry in snapshot {
            if self.seen.contains(entry) {
                continue;
            }
            fresh.push(entry.clone());
            if self.seen.len() == self.capacity {
                self.seen.pop_front();
            }
            self.seen.push_back(entry.clone());
        }
        fresh
    }
}

pub struct DocumentProcessor {
    options: ProcessorOptions,
    store: DocumentStore,
    agent: Arc<ExtractionAgent>,
    watchdog: Watchdog,
    progress: Box<dyn ProgressReporter>,
    graph: Option<Arc<GraphitiClient>>,
    sender: Option<DetachedSender>,
    phase: Phase,
    state: ProcessingState,
    metadata: Option<ProcessMetadata>,
    seen_global: ContextTail,
    document: DocumentInfo,
}

impl DocumentProcessor {
    pub fn new(
        options: ProcessorOptions,
        store: DocumentStore,
        agent: Arc<ExtractionAgent>,
        watchdog: Watchdog,
        progress: Box<dyn ProgressReporter>,
    ) -> Self {
        let document = DocumentInfo {
            name: store
                .dir()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string()),
            description: options.description.clone(),
        };
        Self {
            options,
            store,
            agent,
            watchdog,
            progress,
            graph: None,
            sender: None,
            phase: Phase::Uninitialized,
            state: ProcessingState::default(),
            metadata: None,
            seen_global: ContextTail::new(32),
            document,
        }
    }

    /// Also deliver each persisted chunk to the graph service, if it is
    /// reachable when [`start`](Self::start) runs.
    pub fn with_graph_delivery(mut self, client: Arc<GraphitiClient>) -> Self {
        self.graph = Some(client);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metadata(&self) -> Option<&ProcessMetadata> {
        self.metadata.as_ref()
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), ProcessError> {
        if self.phase != expected {
            return Err(ProcessError::InvalidPhase {
                actual: self.phase,
                expected,
            });
        }
        Ok(())
    }

    /// Prepare persisted state and move to `Processing`.
    ///
    /// With `resume_from == 0` the chunk log is truncated and a new process
    /// id is issued. Otherwise existing files are kept, the process id is
    /// reused and global context is rebuilt from the chunk log.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        self.expect_phase(Phase::Uninitialized)?;

        let source = &self.options.source;
        let file_size = std::fs::metadata(source)
            .map_err(|e| ProcessError::Persist(format!("cannot stat {}: {}", source.display(), e)))?
            .len();
        let estimated = estimate_chunks(file_size, self.options.threshold);
        let now = Utc::now();
        let resume_from = self.options.resume_from;

        let metadata = if resume_from == 0 {
            self.store.prepare_fresh().map_err(persist)?;
            self.new_metadata(file_size, estimated)
        } else {
            self.store.ensure_dir().map_err(persist)?;
            let mut metadata = match self.store.load_metadata().map_err(persist)? {
                Some(existing) => existing,
                None => self.new_metadata(file_size, estimated),
            };
            metadata.status = ProcessStatus::Processing;
            metadata.completed_at = None;
            metadata.file_size = file_size;
            metadata.chunk_size_threshold = self.options.threshold;
            metadata.estimated_chunks = estimated;
            metadata.cursor_position = resume_from;
            if !self.options.description.is_empty() {
                metadata.description = self.options.description.clone();
            }

            let global = self.store.existing_global_context().map_err(persist)?;
            self.seen_global.record(&global);
            info!(entries = global.len(), "restored global context");
            self.agent.restore_global_context(global);
            metadata
        };

        let mut metadata = metadata;
        metadata.last_updated = now;
        self.document.description = metadata.description.clone();
        self.store.save_metadata(&metadata).map_err(persist)?;
        info!(
            process_id = %metadata.process_id,
            resume_from,
            file_size,
            estimated,
            "document processing started"
        );

        if let Some(client) = &self.graph {
            if client.is_available().await {
                self.sender = Some(DetachedSender::new(client.clone()));
            } else {
                warn!(url = %client.base_url(), "graph service unavailable, inline delivery disabled");
            }
        }

        self.progress.report(ProgressEvent::Started {
            document: self.document.name.clone(),
            resume_from,
            file_size,
            estimated_chunks: estimated,
        });
        self.metadata = Some(metadata);
        self.phase = Phase::Processing;
        Ok(())
    }

    fn new_metadata(&self, file_size: u64, estimated: u64) -> ProcessMetadata {
        let source = &self.options.source;
        let now = Utc::now();
        ProcessMetadata {
            process_id: Uuid::now_v7().to_string(),
            filename: source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            filepath: absolute(source).display().to_string(),
            description: self.options.description.clone(),
            chunk_size_threshold: self.options.threshold,
            file_size,
            status: ProcessStatus::Processing,
            processed_at: now,
            last_updated: now,
            completed_at: None,
            cursor_position: 0,
            total_chunks: 0,
            estimated_chunks: estimated,
            current_context: Vec::new(),
        }
    }

    /// Extract, persist and report one chunk.
    pub async fn process_chunk(&mut self, chunk: &StreamChunk) -> Result<ChunkOutcome, ProcessError> {
        self.expect_phase(Phase::Processing)?;

        self.state.chunk_id = Uuid::new_v4().to_string();
        self.state.cursor_position = chunk.start_position;
        self.state.chunk_size = chunk.char_len() as u64;
        self.state.ts_start = Utc::now().timestamp_millis();
        debug!(chunk_id = %self.state.chunk_id, start = chunk.start_position, size = self.state.chunk_size, "processing chunk");

        let guard = self
            .watchdog
            .arm(self.options.source.clone(), chunk.start_position);
        let extracted = self.agent.extract(&chunk.content).await;
        guard.disarm();

        let result = match extracted {
            Ok(result) => result,
            Err(source) => {
                self.phase = Phase::Aborted;
                if let Some(metadata) = self.metadata.as_mut() {
                    metadata.cursor_position = chunk.start_position;
                    metadata.last_updated = Utc::now();
                    self.store.save_metadata(metadata).map_err(persist)?;
                }
                warn!(position = chunk.start_position, error = %source, "chunk failed, position saved");
                return Err(ProcessError::Extraction {
                    cursor_position: chunk.start_position,
                    source,
                });
            }
        };

        self.state.ts_end = Utc::now().timestamp_millis();
        let global = self.agent.global_context();
        let new_global_context = self.seen_global.record(&global);
        self.state.context = ChunkContext {
            current: self.agent.current_context(),
            last_five_global: global,
        };
        // Cursor in the record is where a restart would pick up after it.
        self.state.cursor_position = chunk.end_position;
        let facts = self.agent.flush_facts();

        let metadata = self
            .metadata
            .as_mut()
            .ok_or_else(|| ProcessError::Persist("metadata missing while processing".into()))?;
        metadata.cursor_position = chunk.end_position;
        metadata.total_chunks += 1;
        metadata.current_context = self.state.context.current.clone();
        metadata.last_updated = Utc::now();

        let record = ChunkRecord {
            state: self.state.clone(),
            hashes: ChunkHashes {
                extraction: encoder::encode(&result).map_err(persist)?,
                process_metadata: encoder::encode(&*metadata).map_err(persist)?,
            },
            timestamp: Utc::now(),
        };
        self.store.append_chunk(&record).map_err(persist)?;
        self.store.save_metadata(metadata).map_err(persist)?;

        if let Some(sender) = &self.sender {
            match build_episode(&record, &self.document) {
                Ok(episode) => sender.send(episode),
                Err(e) => warn!(error = %e, "could not build episode for inline delivery"),
            }
        }

        self.progress.report(ProgressEvent::Chunk {
            document: self.document.name.clone(),
            n: metadata.total_chunks,
            estimated: metadata.estimated_chunks,
            cursor: metadata.cursor_position,
            file_size: metadata.file_size,
            facts: facts.len(),
            new_global: new_global_context.len(),
        });

        Ok(ChunkOutcome {
            record,
            facts,
            new_global_context,
        })
    }

    /// Drain in-flight work and mark the document completed. Only valid
    /// once, from `Processing`.
    pub async fn finalize(&mut self) -> Result<ProcessMetadata, ProcessError> {
        self.expect_phase(Phase::Processing)?;
        self.agent.wait_for_idle().await;
        let leftover = self.agent.flush_facts();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "facts buffered after last chunk were discarded");
        }

        let metadata = self
            .metadata
            .as_mut()
            .ok_or_else(|| ProcessError::Persist("metadata missing while processing".into()))?;
        let now = Utc::now();
        metadata.status = ProcessStatus::Completed;
        metadata.completed_at = Some(now);
        metadata.last_updated = now;
        self.store.save_metadata(metadata).map_err(persist)?;
        self.phase = Phase::Completed;

        info!(chunks = metadata.total_chunks, cursor = metadata.cursor_position, "document completed");
        self.progress.report(ProgressEvent::Completed {
            document: self.document.name.clone(),
            chunks: metadata.total_chunks,
            cursor: metadata.cursor_position,
        });
        Ok(metadata.clone())
    }

    /// Wait for inline graph deliveries, up to `deadline`.
    pub async fn shutdown_delivery(&mut self, deadline: Duration) -> Option<DrainReport> {
        let sender = self.sender.take()?;
        Some(sender.drain(deadline).await)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
