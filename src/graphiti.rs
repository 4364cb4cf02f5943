//! Knowledge-graph ingestion client.
//!
//! A deliberately small HTTP client for a Graphiti-style service:
//!
//! - `GET {base}/` availability probe (any status in `200..500` counts as
//!   reachable)
//! - `POST {base}/episodes` with `{content, name, description, reference_time}`
//!
//! Delivery never returns `Err`. Exhausted retries and non-retryable
//! failures come back as an [`EpisodeResponse`] with `success: false` so
//! callers can record the failure and keep going.
//!
//! [`DetachedSender`] is the fire-and-forget path: each episode is sent on a
//! detached task, and failures flow through a channel to a logging task
//! instead of back to the caller.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::config::GraphitiConfig;

/// Substrings of transport errors worth retrying.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "dns error",
    "failed to lookup address",
    "timed out",
    "timeout",
    "error sending request",
];

/// Upper bound on the added jitter fraction of a backoff delay.
const JITTER: f64 = 0.1;

/// Episode payload accepted by the ingestion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphitiEpisode {
    pub content: serde_json::Value,
    pub name: String,
    pub description: String,
    /// RFC 3339 timestamp.
    pub reference_time: String,
}

impl GraphitiEpisode {
    /// Episode with the service's default name and description.
    pub fn new(content: serde_json::Value, name: Option<String>, description: Option<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        Self {
            content,
            name: name.unwrap_or_else(|| format!("episode_{}", now)),
            description: description.unwrap_or_else(|| "Generated episode".to_string()),
            reference_time: now,
        }
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub episode_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

impl EpisodeResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            episode_id: None,
            message: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphitiSettings {
    pub base_url: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub probe_timeout: Duration,
    /// Per-attempt limit on `POST /episodes`.
    pub request_timeout: Duration,
}

impl GraphitiSettings {
    pub fn from_config(config: &GraphitiConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

pub struct GraphitiClient {
    http: reqwest::Client,
    settings: GraphitiSettings,
}

impl GraphitiClient {
    pub fn new(settings: GraphitiSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, settings })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// Probe the service root.
    pub async fn is_available(&self) -> bool {
        let resp = self
            .http
            .get(format!("{}/", self.settings.base_url))
            .timeout(self.settings.probe_timeout)
            .send()
            .await;
        match resp {
            Ok(r) => (200..500).contains(&r.status().as_u16()),
            Err(e) => {
                debug!(url = %self.settings.base_url, error = %e, "graph service probe failed");
                false
            }
        }
    }

    /// Send one episode, retrying 429, 5xx and transient transport errors.
    pub async fn send_episode(&self, episode: &GraphitiEpisode) -> EpisodeResponse {
        let url = format!("{}/episodes", self.settings.base_url);
        let mut last_err = String::from("no attempt made");

        for attempt in 0..=self.settings.max_retries {
            let can_retry = attempt < self.settings.max_retries;
            let resp = self
                .http
                .post(&url)
                .timeout(self.settings.request_timeout)
                .json(episode)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return serde_json::from_str(&body).unwrap_or(EpisodeResponse {
                            success: true,
                            episode_id: None,
                            message: (!body.is_empty()).then_some(body),
                            error: None,
                        });
                    }

                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(retry_after_delay);
                        last_err = format!("HTTP 429 from {}", url);
                        if !can_retry {
                            break;
                        }
                        let delay = retry_after.unwrap_or_else(|| self.backoff(attempt));
                        warn!(attempt, delay_ms = delay.as_millis() as u64, "graph service rate limited");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    last_err = format!("HTTP {}: {}", status.as_u16(), body_text);
                    if status.is_server_error() && can_retry {
                        let delay = self.backoff(attempt);
                        warn!(attempt, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "graph service error, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    // Client error (not 429), or retries spent.
                    break;
                }
                Err(e) => {
                    let message = error_chain(&e);
                    let retryable = e.is_timeout() || e.is_connect() || is_retryable_message(&message);
                    last_err = message;
                    if retryable && can_retry {
                        let delay = self.backoff(attempt);
                        warn!(attempt, error = %last_err, delay_ms = delay.as_millis() as u64, "graph delivery failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break;
                }
            }
        }

        EpisodeResponse::failure(last_err)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.0..JITTER);
        backoff_delay(self.settings.base_delay, attempt, jitter)
    }
}

/// `base × 2^attempt × (1 + jitter)`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let factor = 2f64.powi(attempt.min(16) as i32) * (1.0 + jitter);
    Duration::from_millis((base.as_millis() as f64 * factor).floor() as u64)
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn retry_after_delay(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

// ============ Fire-and-forget delivery ============

#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub episode: String,
    pub error: String,
}

/// Totals after [`DetachedSender::drain`].
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
    /// Sends still running when the drain deadline passed.
    pub abandoned: usize,
}

/// Sends episodes on detached tasks. The caller never waits on delivery;
/// failures are logged by a dedicated task reading an error channel.
pub struct DetachedSender {
    client: Arc<GraphitiClient>,
    tasks: Mutex<JoinSet<()>>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    logger: JoinHandle<Vec<DeliveryFailure>>,
    delivered: Arc<AtomicUsize>,
}

impl DetachedSender {
    /// Must be called inside a Tokio runtime.
    pub fn new(client: Arc<GraphitiClient>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryFailure>();
        let logger = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(failure) = rx.recv().await {
                warn!(episode = %failure.episode, error = %failure.error, "episode delivery failed");
                seen.push(failure);
            }
            seen
        });
        Self {
            client,
            tasks: Mutex::new(JoinSet::new()),
            failures: tx,
            logger,
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue `episode` for delivery and return immediately.
    pub fn send(&self, episode: GraphitiEpisode) {
        let client = self.client.clone();
        let failures = self.failures.clone();
        let delivered = self.delivered.clone();
        let task = async move {
            let resp = client.send_episode(&episode).await;
            if resp.success {
                delivered.fetch_add(1, Ordering::SeqCst);
            } else {
                let _ = failures.send(DeliveryFailure {
                    episode: episode.name,
                    error: resp.error.unwrap_or_else(|| "unknown error".into()),
                });
            }
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set does not grow with the document.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Wait up to `deadline` for outstanding sends, then stop the logger.
    pub async fn drain(self, deadline: Duration) -> DrainReport {
        let mut tasks = self.tasks.into_inner().unwrap_or_else(|e| e.into_inner());
        let _ = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        let abandoned = tasks.len();
        tasks.abort_all();
        // Aborted tasks drop their channel clones as they unwind.
        while tasks.join_next().await.is_some() {}

        drop(self.failures);
        let failures = self.logger.await.unwrap_or_default();
        DrainReport {
            delivered: self.delivered.load(Ordering::SeqCst),
            failures,
            abandoned,
        }
    }
}
