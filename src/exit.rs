//! Process exit-code contract.
//!
//! | Code | Meaning | Supervisor action |
//! |------|---------|-------------------|
//! | `0` | success | stop |
//! | `1` | ambiguous failure | resume |
//! | `2` | extraction timeout or watchdog stall | resume |
//! | `3` | fatal (config, usage, persisted-state I/O) | stop |
//!
//! A child killed by a signal has no code and is treated like `1`.

use std::path::Path;

pub const SUCCESS: i32 = 0;
pub const AMBIGUOUS: i32 = 1;
pub const TIMEOUT: i32 = 2;
pub const FATAL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Ambiguous,
    Timeout,
    Fatal,
}

impl ExitKind {
    /// Classify a child exit code. `None` means terminated by a signal.
    pub fn classify(code: Option<i32>) -> Self {
        match code {
            Some(SUCCESS) => ExitKind::Success,
            Some(AMBIGUOUS) | None => ExitKind::Ambiguous,
            Some(TIMEOUT) => ExitKind::Timeout,
            Some(_) => ExitKind::Fatal,
        }
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, ExitKind::Ambiguous | ExitKind::Timeout)
    }

    pub fn code(self) -> i32 {
        match self {
            ExitKind::Success => SUCCESS,
            ExitKind::Ambiguous => AMBIGUOUS,
            ExitKind::Timeout => TIMEOUT,
            ExitKind::Fatal => FATAL,
        }
    }
}

/// The shell command that resumes `source` from `position`.
pub fn resume_command(source: &Path, position: u64) -> String {
    format!(
        "RESUME_FROM_POSITION={} facts extract {}",
        position,
        source.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ExitKind::classify(Some(0)), ExitKind::Success);
        assert_eq!(ExitKind::classify(Some(1)), ExitKind::Ambiguous);
        assert_eq!(ExitKind::classify(Some(2)), ExitKind::Timeout);
        assert_eq!(ExitKind::classify(Some(3)), ExitKind::Fatal);
        assert_eq!(ExitKind::classify(Some(101)), ExitKind::Fatal);
        assert_eq!(ExitKind::classify(None), ExitKind::Ambiguous);
    }

    #[test]
    fn test_resumable() {
        assert!(ExitKind::Timeout.is_resumable());
        assert!(ExitKind::Ambiguous.is_resumable());
        assert!(!ExitKind::Fatal.is_resumable());
        assert!(!ExitKind::Success.is_resumable());
    }

    #[test]
    fn test_resume_command() {
        assert_eq!(
            resume_command(Path::new("docs/a.txt"), 4500),
            "RESUME_FROM_POSITION=4500 facts extract docs/a.txt"
        );
    }
}
