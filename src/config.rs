//! Configuration parsing and validation.
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual values, then the merged result is validated. Every
//! field has a default so an empty (or missing) file is a valid config.
//!
//! ```toml
//! [chunking]
//! threshold_chars = 1500
//!
//! [extraction]
//! models = ["gpt-4.1-nano", "gpt-5-nano"]
//! timeout_ms = 45000
//!
//! [graphiti]
//! enabled = true
//! url = "http://localhost:8000"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub graphiti: GraphitiConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Position to resume from. Only ever set from the environment;
    /// `0` means "read it from the persisted metadata".
    #[serde(skip)]
    pub resume_from_position: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_threshold_chars")]
    pub threshold_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            threshold_chars: default_threshold_chars(),
        }
    }
}

fn default_threshold_chars() -> usize {
    1500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_batch_chars")]
    pub batch_chars: usize,
    #[serde(default = "default_fallback_encoding")]
    pub fallback_encoding: String,
    #[serde(default = "default_true")]
    pub normalize_nfc: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_chars: default_batch_chars(),
            fallback_encoding: default_fallback_encoding(),
            normalize_nfc: true,
        }
    }
}

fn default_batch_chars() -> usize {
    8192
}
fn default_fallback_encoding() -> String {
    "windows-1252".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra time the watchdog allows on top of `timeout_ms` before it
    /// terminates the process.
    #[serde(default = "default_watchdog_grace_ms")]
    pub watchdog_grace_ms: u64,
    #[serde(default = "default_max_global_context")]
    pub max_global_context: usize,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            timeout_ms: default_timeout_ms(),
            watchdog_grace_ms: default_watchdog_grace_ms(),
            max_global_context: default_max_global_context(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms + self.watchdog_grace_ms)
    }
}

fn default_models() -> Vec<String> {
    [
        "gpt-4.1-nano",
        "gpt-5-nano",
        "gpt-4.1-mini",
        "gpt-4o-mini",
        "gpt-5-mini",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}
fn default_timeout_ms() -> u64 {
    45_000
}
fn default_watchdog_grace_ms() -> u64 {
    5_000
}
fn default_max_global_context() -> usize {
    5
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphitiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_graphiti_url")]
    pub url: String,
    #[serde(default = "default_graphiti_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_delay_between_chunks_ms")]
    pub delay_between_chunks_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for GraphitiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_graphiti_url(),
            max_retries: default_graphiti_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            delay_between_chunks_ms: default_delay_between_chunks_ms(),
            concurrency: default_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_graphiti_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_graphiti_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_delay_ms() -> u64 {
    100
}
fn default_delay_between_chunks_ms() -> u64 {
    200
}
fn default_concurrency() -> usize {
    1
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_fallback_increment")]
    pub fallback_increment: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_supervisor_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_increment: default_fallback_increment(),
        }
    }
}

fn default_supervisor_max_retries() -> u32 {
    50
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_fallback_increment() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    /// Directory under which per-document state directories are created.
    /// When unset, the state directory sits next to the source file.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Load configuration from `path`, apply environment overrides, validate.
///
/// A missing file is not an error when `required` is false; defaults are
/// used instead. This lets `facts extract doc.txt` work with no setup.
pub fn load_config(path: &Path, required: bool) -> Result<Config> {
    let mut config: Config = if path.exists() || required {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Overlay environment variables onto `config`.
///
/// `lookup` abstracts `std::env::var` so tests can feed values without
/// touching the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("CHUNK_SIZE_THRESHOLD") {
        config.chunking.threshold_chars = parse_env("CHUNK_SIZE_THRESHOLD", &v)?;
    }
    if let Some(v) = get("EXTRACTION_TIMEOUT") {
        config.extraction.timeout_ms = parse_env("EXTRACTION_TIMEOUT", &v)?;
    }
    if let Some(v) = get("RESUME_FROM_POSITION") {
        config.resume_from_position = parse_env("RESUME_FROM_POSITION", &v)?;
    }
    if let Some(v) = get("LLM_MODELS") {
        config.extraction.models = v
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
    }
    if let Some(v) = get("LLM_API_BASE") {
        config.extraction.api_base = v;
    }
    if let Some(v) = get("ENABLE_GRAPHITI") {
        config.graphiti.enabled = parse_bool("ENABLE_GRAPHITI", &v)?;
    }
    if let Some(v) = get("GRAPHITI_URL") {
        config.graphiti.url = v;
    }
    if let Some(v) = get("DELAY_BETWEEN_CHUNKS") {
        config.graphiti.delay_between_chunks_ms = parse_env("DELAY_BETWEEN_CHUNKS", &v)?;
    }
    if let Some(v) = get("MAX_RETRIES") {
        config.graphiti.max_retries = parse_env("MAX_RETRIES", &v)?;
    }
    if let Some(v) = get("BATCH_SIZE") {
        config.graphiti.batch_size = parse_env("BATCH_SIZE", &v)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be true or false, got '{}'", key, other),
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.threshold_chars == 0 {
        anyhow::bail!("chunking.threshold_chars must be > 0");
    }
    if config.reader.batch_chars == 0 {
        anyhow::bail!("reader.batch_chars must be > 0");
    }
    if encoding_rs::Encoding::for_label(config.reader.fallback_encoding.as_bytes()).is_none() {
        anyhow::bail!(
            "Unknown reader.fallback_encoding: '{}'",
            config.reader.fallback_encoding
        );
    }

    if config.extraction.models.len() < 2 {
        anyhow::bail!(
            "extraction.models must list at least two models for rotation (got {})",
            config.extraction.models.len()
        );
    }
    if config.extraction.timeout_ms == 0 {
        anyhow::bail!("extraction.timeout_ms must be > 0");
    }
    if config.extraction.max_global_context == 0 {
        anyhow::bail!("extraction.max_global_context must be > 0");
    }

    if config.graphiti.batch_size == 0 {
        anyhow::bail!("graphiti.batch_size must be >= 1");
    }
    if config.graphiti.concurrency == 0 {
        anyhow::bail!("graphiti.concurrency must be >= 1");
    }
    if config.graphiti.request_timeout_ms == 0 {
        anyhow::bail!("graphiti.request_timeout_ms must be > 0");
    }

    Ok(())
}
