//! Extraction run orchestration.
//!
//! Coordinates one document run: resolve the resume position, open the
//! chunk stream, drive the [`DocumentProcessor`] chunk by chunk and turn the
//! result into an [`ExtractOutcome`] that maps onto the process exit-code
//! contract. Also hosts the `extract-all` and `status` commands.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::agent::{AgentSettings, ExtractionAgent};
use crate::chunk;
use crate::config::Config;
use crate::exit::{self, ExitKind};
use crate::graphiti::{GraphitiClient, GraphitiSettings};
use crate::llm::{LlmClient, OpenAiClient};
use crate::models::{ProcessMetadata, ProcessStatus};
use crate::processor::{DocumentProcessor, ProcessError, ProcessorOptions};
use crate::progress::{format_number, ProgressMode, ProgressReporter};
use crate::store::DocumentStore;
use crate::watchdog::Watchdog;

/// How long inline graph deliveries may take to finish after the last chunk.
const DELIVERY_DRAIN: Duration = Duration::from_secs(60);
/// Pause between documents in `extract-all`.
const BETWEEN_DOCUMENTS: Duration = Duration::from_secs(1);

pub const DEFAULT_GLOB: &str = "**/*.txt";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub source: PathBuf,
    pub description: String,
    /// Explicit resume position from the command line.
    pub resume_from: Option<u64>,
    /// Start over even if state exists.
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub enum ExtractOutcome {
    Completed(ProcessMetadata),
    /// Nothing to do: the document finished in an earlier run.
    AlreadyCompleted(ProcessMetadata),
    /// A chunk failed. `position` is where the next run should resume.
    Interrupted {
        kind: ExitKind,
        position: u64,
        error: String,
    },
}

impl ExtractOutcome {
    pub fn exit_kind(&self) -> ExitKind {
        match self {
            ExtractOutcome::Completed(_) | ExtractOutcome::AlreadyCompleted(_) => ExitKind::Success,
            ExtractOutcome::Interrupted { kind, .. } => *kind,
        }
    }
}

/// Where a run should start, given persisted state and the options.
///
/// `None` means the document is already complete and nothing should run.
pub fn resolve_resume(
    config: &Config,
    options: &RunOptions,
    existing: Option<&ProcessMetadata>,
) -> Option<u64> {
    if options.fresh {
        return Some(0);
    }
    if let Some(position) = options.resume_from {
        return Some(position);
    }
    if config.resume_from_position > 0 {
        return Some(config.resume_from_position);
    }
    match existing {
        Some(m) if m.status == ProcessStatus::Completed => None,
        Some(m) => Some(m.cursor_position),
        None => Some(0),
    }
}

/// Run `extract` against the configured chat-completions API.
pub async fn run_extract(
    config: &Config,
    options: &RunOptions,
    progress: Box<dyn ProgressReporter>,
) -> Result<ExtractOutcome> {
    let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::from_config(&config.extraction)?);
    let watchdog = Watchdog::exiting(config.extraction.watchdog_timeout());
    run_extract_with(config, options, client, watchdog, progress).await
}

/// Run `extract` with an explicit model client and watchdog.
///
/// `Err` is fatal (bad input, state that cannot be written). A failing chunk
/// is not an error here; it comes back as [`ExtractOutcome::Interrupted`].
pub async fn run_extract_with(
    config: &Config,
    options: &RunOptions,
    client: Arc<dyn LlmClient>,
    watchdog: Watchdog,
    progress: Box<dyn ProgressReporter>,
) -> Result<ExtractOutcome> {
    let source = &options.source;
    if !source.is_file() {
        bail!("Source file not found: {}", source.display());
    }

    let store = DocumentStore::for_source(source, config.output.root.as_deref());
    let existing = store.load_metadata()?;
    let resume_from = match resolve_resume(config, options, existing.as_ref()) {
        Some(position) => position,
        None => {
            info!(source = %source.display(), "document already completed, skipping");
            return Ok(ExtractOutcome::AlreadyCompleted(
                existing.context("completed metadata vanished")?,
            ));
        }
    };

    let threshold = config.chunking.threshold_chars;
    let agent = Arc::new(ExtractionAgent::new(
        client,
        AgentSettings::from_config(&config.extraction),
    ));
    let mut processor = DocumentProcessor::new(
        ProcessorOptions {
            source: source.clone(),
            description: options.description.clone(),
            threshold,
            resume_from,
        },
        store,
        agent,
        watchdog,
        progress,
    );
    if config.graphiti.enabled {
        let graph = GraphitiClient::new(GraphitiSettings::from_config(&config.graphiti))?;
        processor = processor.with_graph_delivery(Arc::new(graph));
    }

    processor.start().await?;
    let chunks = chunk::chunks(source, threshold, resume_from, &config.reader)
        .with_context(|| format!("Failed to open {}", source.display()))?;

    let mut interrupted = None;
    for next in chunks {
        let next = next.with_context(|| format!("Failed to read {}", source.display()))?;
        match processor.process_chunk(&next).await {
            Ok(_) => {}
            Err(ProcessError::Extraction {
                cursor_position,
                source: cause,
            }) => {
                let kind = if cause.is_timeout() {
                    ExitKind::Timeout
                } else {
                    ExitKind::Ambiguous
                };
                interrupted = Some(ExtractOutcome::Interrupted {
                    kind,
                    position: cursor_position,
                    error: cause.to_string(),
                });
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(report) = processor.shutdown_delivery(DELIVERY_DRAIN).await {
        info!(
            delivered = report.delivered,
            failed = report.failures.len(),
            abandoned = report.abandoned,
            "inline graph delivery drained"
        );
    }

    match interrupted {
        Some(outcome) => Ok(outcome),
        None => Ok(ExtractOutcome::Completed(processor.finalize().await?)),
    }
}

/// Print the human summary of one extraction and return its exit kind.
pub fn report_outcome(source: &Path, outcome: &ExtractOutcome) -> ExitKind {
    match outcome {
        ExtractOutcome::Completed(m) => {
            println!("extract {}", source.display());
            println!("  chunks: {}", format_number(m.total_chunks));
            println!("  characters: {}", format_number(m.cursor_position));
            println!("  process id: {}", m.process_id);
            println!("ok");
        }
        ExtractOutcome::AlreadyCompleted(m) => {
            println!("extract {}", source.display());
            println!(
                "  already completed ({} chunks); use --fresh to start over",
                format_number(m.total_chunks)
            );
            println!("ok");
        }
        ExtractOutcome::Interrupted {
            kind,
            position,
            error,
        } => {
            eprintln!("Extraction stopped at position {}: {}", position, error);
            eprintln!("To resume, run: {}", exit::resume_command(source, *position));
            if *kind == ExitKind::Timeout {
                warn!(position, "chunk timed out");
            }
        }
    }
    outcome.exit_kind()
}

/// Files under `dir` matching `pattern`, relative-path matched and sorted.
pub fn discover_documents(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Directory not found: {}", dir.display());
    }
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(pattern)?);
    let set = builder.build()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        if set.is_match(relative) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Extract every matching document in turn, stopping at the first one that
/// does not finish.
pub async fn run_extract_all(
    config: &Config,
    dir: &Path,
    pattern: &str,
    description: &str,
    progress: ProgressMode,
) -> Result<ExitKind> {
    let files = discover_documents(dir, pattern)?;
    if files.is_empty() {
        println!("No documents matching '{}' under {}", pattern, dir.display());
        return Ok(ExitKind::Success);
    }
    info!(count = files.len(), dir = %dir.display(), "extracting documents");

    for (i, file) in files.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(BETWEEN_DOCUMENTS).await;
        }
        let options = RunOptions {
            source: file.clone(),
            description: description.to_string(),
            ..RunOptions::default()
        };
        let outcome = run_extract(config, &options, progress.reporter()).await?;
        let kind = report_outcome(file, &outcome);
        if kind != ExitKind::Success {
            return Ok(kind);
        }
    }
    println!("extract-all: {} documents", files.len());
    Ok(ExitKind::Success)
}

/// Print the persisted state of one document.
pub fn run_status(config: &Config, source: &Path) -> Result<()> {
    let store = DocumentStore::for_source(source, config.output.root.as_deref());
    let Some(m) = store.load_metadata()? else {
        println!("{}: not started", source.display());
        return Ok(());
    };
    let records = store.read_chunks()?;
    let status = match m.status {
        ProcessStatus::Processing => "processing",
        ProcessStatus::Completed => "completed",
    };

    println!("{}", source.display());
    println!("  status: {}", status);
    println!("  process id: {}", m.process_id);
    println!(
        "  cursor: {} / {}",
        format_number(m.cursor_position),
        format_number(m.file_size)
    );
    println!(
        "  chunks: {} recorded (~{} estimated)",
        format_number(records.len() as u64),
        format_number(m.estimated_chunks)
    );
    println!("  last updated: {}", m.last_updated.to_rfc3339());
    if let Some(done) = m.completed_at {
        println!("  completed: {}", done.to_rfc3339());
    } else {
        println!("  resume: {}", exit::resume_command(source, m.cursor_position));
    }
    println!("  state: {}", store.dir().display());
    Ok(())
}
