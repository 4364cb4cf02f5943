//! Stall watchdog for chunk processing.
//!
//! The extraction agent already races each call against a deadline, which
//! covers every case where the async runtime keeps making progress. The
//! watchdog is the backstop for the rest: it runs on its own OS thread and,
//! if a chunk is still unfinished after `timeout`, invokes the stall handler.
//! The default handler prints the resume position and command to stderr and
//! exits the whole process with [`exit::TIMEOUT`](crate::exit::TIMEOUT) so
//! the supervisor can restart cleanly.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::exit;

/// What the watchdog knows about the chunk it is guarding.
#[derive(Debug, Clone)]
pub struct StallReport {
    pub source: PathBuf,
    pub cursor_position: u64,
    pub waited: Duration,
}

pub type StallHandler = Arc<dyn Fn(&StallReport) + Send + Sync>;

#[derive(Clone)]
pub struct Watchdog {
    timeout: Duration,
    on_stall: StallHandler,
}

impl Watchdog {
    pub fn new(timeout: Duration, on_stall: StallHandler) -> Self {
        Self { timeout, on_stall }
    }

    /// Watchdog that terminates the process on stall.
    pub fn exiting(timeout: Duration) -> Self {
        Self::new(timeout, Arc::new(terminate))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start guarding one chunk. Dropping (or disarming) the guard stops it.
    pub fn arm(&self, source: PathBuf, cursor_position: u64) -> WatchdogGuard {
        let (tx, rx) = mpsc::channel::<()>();
        let timeout = self.timeout;
        let on_stall = self.on_stall.clone();
        let report = StallReport {
            source,
            cursor_position,
            waited: timeout,
        };
        let handle = std::thread::Builder::new()
            .name("chunk-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    on_stall(&report);
                }
            })
            .ok();
        if handle.is_none() {
            tracing::warn!("could not start watchdog thread; chunk runs unguarded");
        }
        WatchdogGuard {
            tx: Some(tx),
            handle,
        }
    }
}

/// Live watchdog for one chunk.
pub struct WatchdogGuard {
    tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WatchdogGuard {
    pub fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

fn terminate(report: &StallReport) {
    eprintln!(
        "FORCED TERMINATION: chunk at position {} of {} did not finish within {}ms",
        report.cursor_position,
        report.source.display(),
        report.waited.as_millis()
    );
    eprintln!(
        "To resume, run: {}",
        exit::resume_command(&report.source, report.cursor_position)
    );
    std::process::exit(exit::TIMEOUT);
}
