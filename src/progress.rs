//! Extraction progress reporting.
//!
//! Reports observable progress while a document is processed so users see
//! how far along a many-hour run is. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for one document.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Processing began (or resumed) for a document.
    Started {
        document: String,
        resume_from: u64,
        file_size: u64,
        estimated_chunks: u64,
    },
    /// One chunk was extracted and persisted.
    Chunk {
        document: String,
        n: u64,
        estimated: u64,
        cursor: u64,
        file_size: u64,
        facts: usize,
        new_global: usize,
    },
    /// The document reached `completed`.
    Completed {
        document: String,
        chunks: u64,
        cursor: u64,
    },
}

/// Reports extraction progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// "extract moby.txt  chunk 12 / 40  at 18,000 / 60,000  +7 facts  +1 context".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started {
                document,
                resume_from,
                estimated_chunks,
                ..
            } => {
                if *resume_from > 0 {
                    format!(
                        "extract {}  resuming at {}  (~{} chunks total)\n",
                        document,
                        format_number(*resume_from),
                        format_number(*estimated_chunks)
                    )
                } else {
                    format!(
                        "extract {}  starting  (~{} chunks)\n",
                        document,
                        format_number(*estimated_chunks)
                    )
                }
            }
            ProgressEvent::Chunk {
                document,
                n,
                estimated,
                cursor,
                file_size,
                facts,
                new_global,
            } => format!(
                "extract {}  chunk {} / {}  at {} / {}  +{} facts  +{} context\n",
                document,
                format_number(*n),
                format_number(*estimated),
                format_number(*cursor),
                format_number(*file_size),
                facts,
                new_global
            ),
            ProgressEvent::Completed {
                document,
                chunks,
                cursor,
            } => format!(
                "extract {}  completed  {} chunks  {} chars\n",
                document,
                format_number(*chunks),
                format_number(*cursor)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// The JSON line emitted for `event`.
pub fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Started {
            document,
            resume_from,
            file_size,
            estimated_chunks,
        } => serde_json::json!({
            "event": "progress",
            "document": document,
            "phase": "started",
            "resume_from": resume_from,
            "file_size": file_size,
            "estimated_chunks": estimated_chunks
        }),
        ProgressEvent::Chunk {
            document,
            n,
            estimated,
            cursor,
            file_size,
            facts,
            new_global,
        } => serde_json::json!({
            "event": "progress",
            "document": document,
            "phase": "chunk",
            "n": n,
            "estimated": estimated,
            "cursor": cursor,
            "file_size": file_size,
            "facts": facts,
            "new_global": new_global
        }),
        ProgressEvent::Completed {
            document,
            chunks,
            cursor,
        } => serde_json::json!({
            "event": "progress",
            "document": document,
            "phase": "completed",
            "chunks": chunks,
            "cursor": cursor
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, d) in digits.char_indices() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(d);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
