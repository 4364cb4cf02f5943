//! Restart loop around the `extract` child process.
//!
//! The supervisor runs extraction as a separate process so a hung model call
//! or a watchdog exit never takes the supervisor down with it. After every
//! resumable exit (see [`ExitKind`]) it re-reads the persisted cursor and
//! starts a new child with `RESUME_FROM_POSITION` set. If the cursor did not
//! move, it nudges the position forward by a fixed increment so a chunk that
//! keeps failing cannot stall the run forever.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{Config, SupervisorConfig};
use crate::exit::ExitKind;
use crate::store::DocumentStore;

pub const RESUME_ENV: &str = "RESUME_FROM_POSITION";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Total child runs before giving up, counting the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub fallback_increment: u64,
}

impl SupervisorSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            fallback_increment: config.fallback_increment,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start extraction process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extraction failed with non-resumable exit code {code:?}")]
    Fatal { code: Option<i32> },
    #[error("gave up after {attempts} attempts; last position {last_position}")]
    RetriesExhausted { attempts: u32, last_position: u64 },
}

/// Reads the persisted resume position, if any.
pub type PositionProbe = Box<dyn Fn() -> Option<u64> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub attempts: u32,
    pub final_position: u64,
}

pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    settings: SupervisorSettings,
    probe: PositionProbe,
}

impl Supervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        settings: SupervisorSettings,
        probe: PositionProbe,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            settings,
            probe,
        }
    }

    /// Next position after a resumable exit from `last`.
    fn next_position(&self, last: u64) -> u64 {
        match (self.probe)() {
            Some(saved) if saved > last => saved,
            _ => {
                let bumped = last + self.settings.fallback_increment;
                warn!(
                    from = last,
                    to = bumped,
                    "no progress recorded, skipping ahead"
                );
                bumped
            }
        }
    }

    /// Run children until one exits successfully or with a fatal code.
    ///
    /// The first child gets position `0`, which lets it pick up any
    /// persisted state on its own.
    pub async fn run(&self) -> Result<SupervisorReport, SupervisorError> {
        let mut position = 0u64;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            info!(attempt = attempts, position, "starting extraction process");
            let status = Command::new(&self.program)
                .args(&self.args)
                .env(RESUME_ENV, position.to_string())
                .stdin(Stdio::null())
                .status()
                .await?;

            let kind = ExitKind::classify(status.code());
            match kind {
                ExitKind::Success => {
                    let final_position = (self.probe)().unwrap_or(position);
                    info!(attempts, final_position, "extraction finished");
                    return Ok(SupervisorReport {
                        attempts,
                        final_position,
                    });
                }
                ExitKind::Fatal => {
                    return Err(SupervisorError::Fatal {
                        code: status.code(),
                    })
                }
                ExitKind::Ambiguous | ExitKind::Timeout => {}
            }

            if attempts >= self.settings.max_retries {
                return Err(SupervisorError::RetriesExhausted {
                    attempts,
                    last_position: position,
                });
            }
            position = self.next_position(position);
            warn!(
                code = ?status.code(),
                ?kind,
                next = position,
                retry_in_ms = self.settings.retry_delay.as_millis() as u64,
                "extraction exited, restarting"
            );
            tokio::time::sleep(self.settings.retry_delay).await;
        }
    }
}

/// Supervise `facts extract <source>` using this executable.
pub async fn run_supervise(
    config: &Config,
    config_path: Option<&Path>,
    source: &Path,
    description: Option<&str>,
) -> anyhow::Result<SupervisorReport> {
    if !source.is_file() {
        anyhow::bail!("Source file not found: {}", source.display());
    }
    let program = std::env::current_exe()?;
    let mut args: Vec<OsString> = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.into());
    }
    args.push("extract".into());
    args.push(source.into());
    if let Some(text) = description {
        args.push("--description".into());
        args.push(text.into());
    }

    let store = DocumentStore::for_source(source, config.output.root.as_deref());
    let probe: PositionProbe = Box::new(move || match store.load_metadata() {
        Ok(meta) => meta.map(|m| m.cursor_position),
        Err(e) => {
            warn!(error = %e, "could not read saved position");
            None
        }
    });

    let supervisor = Supervisor::new(
        program,
        args,
        SupervisorSettings::from_config(&config.supervisor),
        probe,
    );
    Ok(supervisor.run().await?)
}
