//! # Fact Harness
//!
//! A resumable pipeline that streams long text documents through a language
//! model, extracting subject–predicate–object facts chunk by chunk, and
//! optionally replays the results into a Graphiti knowledge graph.
//!
//! Runs over book-length inputs take hours, so every chunk is persisted as it
//! completes and any interruption (timeout, rate limit, crash) can resume from
//! the last durable cursor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌─────────────────┐   ┌────────────────┐
//! │UnicodeReader │──▶│ Chunker │──▶│DocumentProcessor│──▶│ metadata.json  │
//! │ decode + NFC │   │         │   │ agent+watchdog  │   │ chunks.jsonl   │
//! └──────────────┘   └─────────┘   └────────┬────────┘   └───────┬────────┘
//!                                           │ inline             │ replay
//!                                           ▼                    ▼
//!                                    ┌────────────────────────────────┐
//!                                    │  GraphitiClient  (/episodes)   │
//!                                    └────────────────────────────────┘
//!
//!  Supervisor ── restarts `facts extract` on exit codes 1 and 2
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=...
//! facts extract ./books/moby-dick.txt --description "Novel, 1851"
//! facts status ./books/moby-dick.txt
//! facts supervise ./books/moby-dick.txt      # restart on timeouts
//! facts graph ./books/moby-dick/chunks.jsonl # push to Graphiti
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`unicode`] | Streaming decode, sanitize and NFC-normalize |
//! | [`chunk`] | Paragraph-aligned chunking with resume |
//! | [`models`] | Persisted record types |
//! | [`encoder`] | zstd + base64 payload encoding |
//! | [`llm`] | Chat-completions client and mock |
//! | [`agent`] | Serialized extraction with model rotation |
//! | [`store`] | Per-document state directory |
//! | [`watchdog`] | Stall backstop per chunk |
//! | [`processor`] | Per-document state machine |
//! | [`runner`] | `extract`, `extract-all`, `status` |
//! | [`graphiti`] | Graphiti HTTP client with retries |
//! | [`graph_writer`] | Chunk-log replay into the graph |
//! | [`supervisor`] | Restart loop around `extract` |
//! | [`exit`] | Exit-code contract |
//! | [`progress`] | Progress reporting on stderr |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod encoder;
pub mod exit;
pub mod graph_writer;
pub mod graphiti;
pub mod llm;
pub mod models;
pub mod processor;
pub mod progress;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod unicode;
pub mod watchdog;
