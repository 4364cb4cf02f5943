//! # Fact Harness CLI (`facts`)
//!
//! The `facts` binary extracts facts from long documents, reports their
//! progress, supervises restarts and replays results into a knowledge graph.
//!
//! ## Usage
//!
//! ```bash
//! facts --config ./config/facts.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `facts extract <file>` | Extract facts from one document, resuming if state exists |
//! | `facts extract-all <dir>` | Extract every matching document under a directory |
//! | `facts status <file>` | Show the persisted progress of a document |
//! | `facts supervise <file>` | Run `extract` in a child process, restarting on failure |
//! | `facts graph <path>` | Send chunk logs to Graphiti |
//!
//! ## Exit codes
//!
//! `0` success, `1` resumable failure, `2` timeout (resumable), `3` fatal.
//!
//! ## Examples
//!
//! ```bash
//! # Resume from an explicit character position
//! RESUME_FROM_POSITION=48213 facts extract ./books/moby-dick.txt
//!
//! # Start over, discarding previous results
//! facts extract ./books/moby-dick.txt --fresh
//!
//! # Replay one document's log, resuming at a chunk
//! facts graph ./books/moby-dick/chunks.jsonl --from-chunk 6f1c...
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use fact_harness::config::{self, Config};
use fact_harness::exit::{self, ExitKind};
use fact_harness::graph_writer;
use fact_harness::progress::ProgressMode;
use fact_harness::runner::{self, RunOptions};
use fact_harness::supervisor::{self, SupervisorError};

const DEFAULT_CONFIG: &str = "./config/facts.toml";

/// Fact Harness: resumable fact extraction from long documents.
///
/// Settings come from a TOML file (see `config/facts.example.toml`) and can
/// be overridden with environment variables such as `CHUNK_SIZE_THRESHOLD`,
/// `EXTRACTION_TIMEOUT` and `RESUME_FROM_POSITION`.
#[derive(Parser)]
#[command(name = "facts", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/facts.toml`; built-in defaults apply if that
    /// file does not exist. A path given here must exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract facts from a document.
    ///
    /// Resumes automatically from the saved cursor unless `--fresh` is
    /// given. A document already marked completed is skipped.
    Extract {
        /// Source text file.
        file: PathBuf,

        /// Character position to resume from. Overrides saved state.
        #[arg(long)]
        resume_from: Option<u64>,

        /// Discard previous results and start at the beginning.
        #[arg(long)]
        fresh: bool,

        /// Human description of the document, stored in metadata.
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Extract every matching document under a directory, one at a time.
    ExtractAll {
        dir: PathBuf,

        /// Glob matched against paths relative to `dir`.
        #[arg(long, default_value = runner::DEFAULT_GLOB)]
        glob: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Send extracted chunks to Graphiti.
    ///
    /// `path` is a `chunks.jsonl` file or a directory searched for them.
    Graph {
        path: PathBuf,

        /// Start at this chunk id instead of the beginning.
        #[arg(long)]
        from_chunk: Option<String>,

        /// Send in batches without waiting for each delivery.
        #[arg(long)]
        fire_and_forget: bool,
    },

    /// Run `extract` in a child process and restart it on resumable exits.
    Supervise {
        file: PathBuf,

        #[arg(long)]
        description: Option<String>,
    },

    /// Show saved progress for a document.
    Status { file: PathBuf },
}

fn code(kind: ExitKind) -> ExitCode {
    ExitCode::from(kind.code() as u8)
}

fn fatal(err: anyhow::Error) -> ExitCode {
    eprintln!("Error: {:#}", err);
    ExitCode::from(exit::FATAL as u8)
}

fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => config::load_config(path, true),
        None => config::load_config(Path::new(DEFAULT_CONFIG), false),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit::FATAL as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = match load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => return fatal(e),
    };
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Extract {
            file,
            resume_from,
            fresh,
            description,
        } => {
            let options = RunOptions {
                source: file.clone(),
                description,
                resume_from,
                fresh,
            };
            match runner::run_extract(&cfg, &options, progress.reporter()).await {
                Ok(outcome) => code(runner::report_outcome(&file, &outcome)),
                Err(e) => fatal(e),
            }
        }
        Commands::ExtractAll {
            dir,
            glob,
            description,
        } => match runner::run_extract_all(&cfg, &dir, &glob, &description, progress).await {
            Ok(kind) => code(kind),
            Err(e) => fatal(e),
        },
        Commands::Graph {
            path,
            from_chunk,
            fire_and_forget,
        } => match graph_writer::run_graph(&cfg, &path, from_chunk.as_deref(), fire_and_forget)
            .await
        {
            Ok(result) if result.errors.is_empty() => ExitCode::SUCCESS,
            Ok(_) => code(ExitKind::Ambiguous),
            Err(e) => fatal(e),
        },
        Commands::Supervise { file, description } => {
            match supervisor::run_supervise(
                &cfg,
                cli.config.as_deref(),
                &file,
                description.as_deref(),
            )
            .await
            {
                Ok(report) => {
                    println!("supervise {}", file.display());
                    println!("  attempts: {}", report.attempts);
                    println!("  final position: {}", report.final_position);
                    println!("ok");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    if let Some(SupervisorError::RetriesExhausted { last_position, .. }) =
                        e.downcast_ref::<SupervisorError>()
                    {
                        eprintln!("Error: {:#}", e);
                        eprintln!(
                            "To resume, run: {}",
                            exit::resume_command(&file, *last_position)
                        );
                        return code(ExitKind::Ambiguous);
                    }
                    fatal(e)
                }
            }
        }
        Commands::Status { file } => match runner::run_status(&cfg, &file) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fatal(e),
        },
    }
}
