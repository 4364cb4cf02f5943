//! Extraction agent: one LLM conversation per document.
//!
//! The agent owns the rolling narrative state for a document (global and
//! current context), the buffer of facts not yet handed to the processor,
//! and the model-rotation cursor. One agent serves exactly one document and
//! is never shared across documents.
//!
//! # Concurrency
//!
//! [`ExtractionAgent::extract`] calls are serialized through a fair async
//! mutex: concurrent callers are admitted in FIFO order and at most one
//! request is ever in flight against the LLM.
//!
//! # Model rotation
//!
//! A rate-limited call advances to the next model (wrapping), waits
//! `500ms + 200ms × attempt`, and retries, for at most `models.len()`
//! attempts. Any other error fails at once without rotating. The whole
//! rotation loop runs under a single wall-clock deadline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::llm::{ExtractionRequest, LlmClient, LlmError};
use crate::models::{ExtractionResult, Fact};

/// Global context entries shown to the model in each request.
const PROMPT_GLOBAL_TAIL: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("All available models are rate limited. Last error: {last}")]
    ModelsExhausted { last: LlmError },
    #[error("Extraction failed on model {model}: {source}")]
    Llm {
        model: String,
        #[source]
        source: LlmError,
    },
}

impl ExtractionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExtractionError::TimedOut(_))
    }
}

/// Tunables for an [`ExtractionAgent`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub models: Vec<String>,
    pub timeout: Duration,
    pub max_global_context: usize,
    pub rotation_backoff: Duration,
    pub rotation_backoff_step: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            models: config.models.clone(),
            timeout: config.timeout(),
            max_global_context: config.max_global_context,
            rotation_backoff: Duration::from_millis(500),
            rotation_backoff_step: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct AgentState {
    model_index: usize,
    global: VecDeque<String>,
    current: Vec<String>,
    facts: Vec<Fact>,
}

pub struct ExtractionAgent {
    client: Arc<dyn LlmClient>,
    settings: AgentSettings,
    queue: tokio::sync::Mutex<()>,
    state: Mutex<AgentState>,
}

impl ExtractionAgent {
    pub fn new(client: Arc<dyn LlmClient>, settings: AgentSettings) -> Self {
        Self {
            client,
            settings,
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(AgentState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        // State updates are plain field writes, so a poisoned lock still
        // holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Extract facts from `chunk`.
    ///
    /// On success the result is also folded into the agent: facts are
    /// buffered for [`flush_facts`](Self::flush_facts), global context is
    /// appended and trimmed, current context is replaced.
    pub async fn extract(&self, chunk: &str) -> Result<ExtractionResult, ExtractionError> {
        let _turn = self.queue.lock().await;

        let request = {
            let state = self.state();
            let skip = state.global.len().saturating_sub(PROMPT_GLOBAL_TAIL);
            let global: Vec<String> = state.global.iter().skip(skip).cloned().collect();
            ExtractionRequest::new(chunk, &global, &state.current)
        };

        let result = tokio::time::timeout(self.settings.timeout, self.rotate(&request))
            .await
            .map_err(|_| ExtractionError::TimedOut(self.settings.timeout))??;

        let mut state = self.state();
        state.global.extend(result.global_context.iter().cloned());
        while state.global.len() > self.settings.max_global_context {
            state.global.pop_front();
        }
        state.current = result
            .current_context
            .iter()
            .take(ExtractionResult::MAX_CURRENT_CONTEXT)
            .cloned()
            .collect();
        state.facts.extend(result.facts.iter().cloned());
        Ok(result)
    }

    async fn rotate(&self, request: &ExtractionRequest) -> Result<ExtractionResult, ExtractionError> {
        let attempts = self.settings.models.len();
        let mut last_err = None;

        for attempt in 0..attempts {
            let model = self.current_model();
            debug!(model = %model, attempt, "requesting extraction");

            match self.client.extract(&model, request).await {
                Ok(result) => {
                    result.check_bounds().map_err(|reason| ExtractionError::Llm {
                        model: model.clone(),
                        source: LlmError::InvalidResponse(reason),
                    })?;
                    return Ok(result);
                }
                Err(e) if e.is_rate_limited() => {
                    let next = {
                        let mut state = self.state();
                        state.model_index = (state.model_index + 1) % attempts;
                        self.settings.models[state.model_index].clone()
                    };
                    warn!(model = %model, next = %next, error = %e, "model rate limited, rotating");
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        let delay = self.settings.rotation_backoff
                            + self.settings.rotation_backoff_step * attempt as u32;
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(ExtractionError::Llm { model, source: e }),
            }
        }

        Err(ExtractionError::ModelsExhausted {
            last: last_err.unwrap_or_else(|| LlmError::RateLimited("no models configured".into())),
        })
    }

    /// Drain buffered facts. The caller owns them from here on.
    pub fn flush_facts(&self) -> Vec<Fact> {
        std::mem::take(&mut self.state().facts)
    }

    /// Snapshot of the bounded global context, oldest first.
    pub fn global_context(&self) -> Vec<String> {
        self.state().global.iter().cloned().collect()
    }

    pub fn current_context(&self) -> Vec<String> {
        self.state().current.clone()
    }

    /// Model the next request will use.
    pub fn current_model(&self) -> String {
        let state = self.state();
        self.settings.models[state.model_index % self.settings.models.len()].clone()
    }

    /// Re-seed global context on resume. Only the newest entries that fit
    /// the bound are kept.
    pub fn restore_global_context(&self, entries: Vec<String>) {
        let max = self.settings.max_global_context;
        let skip = entries.len().saturating_sub(max);
        self.state().global = entries.into_iter().skip(skip).collect();
    }

    /// Wait until no extraction is in flight or queued ahead of this call.
    pub async fn wait_for_idle(&self) {
        let _turn = self.queue.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn result(tag: &str) -> ExtractionResult {
        ExtractionResult {
            global_context: vec![format!("global {}", tag)],
            current_context: vec![format!("current {}", tag)],
            facts: (0..3)
                .map(|i| Fact {
                    subject: format!("{}-{}", tag, i),
                    predicate: "p".into(),
                    object: "o".into(),
                    source: None,
                })
                .collect(),
        }
    }

    fn settings(models: &[&str]) -> AgentSettings {
        AgentSettings {
            models: models.iter().map(|m| m.to_string()).collect(),
            timeout: Duration::from_secs(5),
            max_global_context: 5,
            rotation_backoff: Duration::from_millis(1),
            rotation_backoff_step: Duration::from_millis(1),
        }
    }

    fn rate_limited() -> Result<ExtractionResult, LlmError> {
        Err(LlmError::RateLimited("429".into()))
    }

    #[tokio::test]
    async fn test_rotation_lands_on_third_model() {
        let client = Arc::new(MockLlmClient::scripted(vec![
            rate_limited(),
            rate_limited(),
            Ok(result("a")),
        ]));
        let agent = ExtractionAgent::new(client.clone(), settings(&["m0", "m1", "m2", "m3"]));

        let out = agent.extract("text").await.unwrap();
        assert_eq!(out, result("a"));
        assert_eq!(agent.current_model(), "m2");
        assert_eq!(client.models_called(), vec!["m0", "m1", "m2"]);
        assert_eq!(agent.flush_facts().len(), 3);
    }

    #[tokio::test]
    async fn test_all_models_rate_limited() {
        let client = Arc::new(MockLlmClient::scripted(vec![
            rate_limited(),
            rate_limited(),
            Err(LlmError::Api { status: 429, message: "last one".into() }),
        ]));
        let agent = ExtractionAgent::new(client.clone(), settings(&["a", "b", "c"]));

        let err = agent.extract("text").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("All available models are rate limited"));
        assert!(msg.contains("last one"));
        assert_eq!(client.models_called().len(), 3);
        // Wrapped all the way around.
        assert_eq!(agent.current_model(), "a");
    }

    #[tokio::test]
    async fn test_non_rate_limit_error_fails_without_rotation() {
        let client = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::Api {
            status: 400,
            message: "bad request".into(),
        })]));
        let agent = ExtractionAgent::new(client.clone(), settings(&["a", "b"]));

        let err = agent.extract("text").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Llm { .. }));
        assert!(!err.is_timeout());
        assert_eq!(client.models_called(), vec!["a"]);
        assert_eq!(agent.current_model(), "a");
    }

    #[tokio::test]
    async fn test_out_of_bounds_response_is_fatal() {
        let mut bad = result("x");
        bad.facts.truncate(1);
        let client = Arc::new(MockLlmClient::scripted(vec![Ok(bad)]));
        let agent = ExtractionAgent::new(client.clone(), settings(&["a", "b"]));

        let err = agent.extract("text").await.unwrap_err();
        assert!(err.to_string().contains("facts"));
        assert_eq!(client.models_called().len(), 1);
        assert!(agent.flush_facts().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let client = Arc::new(MockLlmClient::always(result("slow")).with_delay(Duration::from_millis(200)));
        let mut s = settings(&["a", "b"]);
        s.timeout = Duration::from_millis(20);
        let agent = ExtractionAgent::new(client, s);

        let err = agent.extract("text").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_global_context_bounded() {
        let client = Arc::new(MockLlmClient::scripted(
            (0..12).map(|i| Ok(result(&i.to_string()))).collect(),
        ));
        let agent = ExtractionAgent::new(client, settings(&["a", "b"]));

        for _ in 0..12 {
            agent.extract("text").await.unwrap();
            assert!(agent.global_context().len() <= 5);
        }
        assert_eq!(agent.global_context().first().unwrap(), "global 7");
        assert_eq!(agent.global_context().last().unwrap(), "global 11");
        assert_eq!(agent.current_context(), vec!["current 11"]);
    }

    #[tokio::test]
    async fn test_context_flows_into_next_request() {
        let client = Arc::new(MockLlmClient::always(result("r")));
        let agent = ExtractionAgent::new(client.clone(), settings(&["a", "b"]));
        agent.restore_global_context(vec!["old".into()]);

        agent.extract("first").await.unwrap();
        agent.extract("second").await.unwrap();

        let requests = client.requests();
        assert_eq!(requests[0].messages[1].content, "DOCUMENT CONTEXT:\n\nold");
        assert_eq!(requests[1].messages[1].content, "DOCUMENT CONTEXT:\n\nold\nglobal r");
        assert_eq!(requests[1].messages[2].content, "CURRENT CONTEXT:\n\ncurrent r");
        assert_eq!(requests[1].chunk(), "second");
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let client = Arc::new(MockLlmClient::always(result("c")).with_delay(Duration::from_millis(20)));
        let agent = Arc::new(ExtractionAgent::new(client.clone(), settings(&["a", "b"])));

        let mut handles = Vec::new();
        for i in 0..4 {
            let agent = agent.clone();
            handles.push(tokio::spawn(async move {
                agent.extract(&format!("chunk {}", i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        agent.wait_for_idle().await;

        assert_eq!(client.max_in_flight(), 1);
        assert_eq!(agent.flush_facts().len(), 12);
        assert!(agent.flush_facts().is_empty());
    }

    #[test]
    fn test_restore_keeps_newest() {
        let agent = ExtractionAgent::new(
            Arc::new(MockLlmClient::scripted(vec![])),
            settings(&["a", "b"]),
        );
        agent.restore_global_context((0..8).map(|i| i.to_string()).collect());
        assert_eq!(agent.global_context(), vec!["3", "4", "5", "6", "7"]);
    }
}
