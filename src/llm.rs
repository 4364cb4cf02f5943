//! LLM boundary for fact extraction.
//!
//! [`LlmClient`] abstracts one structured-output call against a named model.
//! Two implementations:
//! - [`OpenAiClient`]: OpenAI-compatible `POST /chat/completions` with a
//!   strict JSON-schema response format (production)
//! - [`MockLlmClient`]: returns scripted responses (testing)
//!
//! Model rotation, timeouts and context bookkeeping live in
//! [`crate::agent`]; a client performs exactly one request per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ExtractionConfig;
use crate::models::ExtractionResult;

const SYSTEM_PROMPT: &str = "You extract facts from document parts, adding anything necessary to \
understand the facts to global context and attributing facts to specific document parts that can \
be cited later. You must carefully attribute each fact to a citable reference in the source document.";

/// Substrings that mark an error message as a throughput/quota rejection.
const RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "quota", "too many requests"];

/// Errors from a single LLM call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM response violates the extraction contract: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// True for HTTP 429 or any message that reads like a quota rejection.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            LlmError::RateLimited(_) => true,
            LlmError::Api { status: 429, .. } => true,
            LlmError::InvalidResponse(_) => false,
            other => {
                let msg = other.to_string().to_lowercase();
                RATE_LIMIT_PATTERNS.iter().any(|p| msg.contains(p))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// The prompt for one chunk: instructions, bounded context, chunk text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub messages: Vec<ChatMessage>,
}

impl ExtractionRequest {
    pub fn new(chunk: &str, global_context: &[String], current_context: &[String]) -> Self {
        let document_context = if global_context.is_empty() {
            "No additional information".to_string()
        } else {
            global_context.join("\n")
        };
        let current = if current_context.is_empty() {
            "No additional information".to_string()
        } else {
            current_context.join("\n")
        };
        Self {
            messages: vec![
                ChatMessage::new("system", SYSTEM_PROMPT),
                ChatMessage::new("assistant", format!("DOCUMENT CONTEXT:\n\n{}", document_context)),
                ChatMessage::new("assistant", format!("CURRENT CONTEXT:\n\n{}", current)),
                ChatMessage::new("user", chunk),
            ],
        }
    }

    /// The chunk text this request carries.
    pub fn chunk(&self) -> &str {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Client trait for structured fact extraction.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one extraction against `model`. No retries.
    async fn extract(
        &self,
        model: &str,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, LlmError>;
}

// ============ OpenAI-compatible client ============

/// Production client for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build a client from config, reading the API key from the configured
    /// environment variable.
    pub fn from_config(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} not set", config.api_key_env))?;
        // The agent enforces the real deadline; this only bounds a hung socket.
        let http = reqwest::Client::builder()
            .timeout(config.timeout() + Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn extract(
        &self,
        model: &str,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, LlmError> {
        let body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "fact_extraction",
                    "strict": true,
                    "schema": response_schema(),
                }
            }
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited(body_text));
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: body_text,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        parse_chat_response(&json)
    }
}

/// Pull the structured result out of a chat completions response.
pub fn parse_chat_response(json: &serde_json::Value) -> Result<ExtractionResult, LlmError> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".into()))?;

    if let Some(refusal) = message.get("refusal").and_then(|r| r.as_str()) {
        return Err(LlmError::InvalidResponse(format!("model refused: {}", refusal)));
    }

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| LlmError::InvalidResponse("missing message content".into()))?;

    serde_json::from_str(content)
        .map_err(|e| LlmError::InvalidResponse(format!("content is not an extraction result: {}", e)))
}

/// JSON schema sent as the response format.
pub fn response_schema() -> serde_json::Value {
    let string_list = |min: usize, max: usize| {
        serde_json::json!({
            "type": "array",
            "items": { "type": "string" },
            "minItems": min,
            "maxItems": max,
        })
    };
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["globalContext", "currentContext", "facts"],
        "properties": {
            "globalContext": string_list(1, ExtractionResult::MAX_GLOBAL_CONTEXT),
            "currentContext": string_list(1, ExtractionResult::MAX_CURRENT_CONTEXT),
            "facts": {
                "type": "array",
                "minItems": ExtractionResult::MIN_FACTS,
                "maxItems": ExtractionResult::MAX_FACTS,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["subject", "predicate", "object", "source"],
                    "properties": {
                        "subject": { "type": "string" },
                        "predicate": { "type": "string" },
                        "object": { "type": "string" },
                        "source": { "type": ["string", "null"] },
                    }
                }
            }
        }
    })
}

// ============ Mock client ============

/// Mock client for testing: replays scripted outcomes in order and records
/// which models were asked.
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ExtractionResult, LlmError>>>,
    fallback: Option<ExtractionResult>,
    delay: Duration,
    calls: Mutex<Vec<(String, ExtractionRequest)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLlmClient {
    /// A client that answers every call with `result`.
    pub fn always(result: ExtractionResult) -> Self {
        Self::scripted(Vec::new()).with_fallback(result)
    }

    /// A client that returns `script` outcomes one per call.
    pub fn scripted(script: Vec<Result<ExtractionResult, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Result returned once the script runs out.
    pub fn with_fallback(mut self, result: ExtractionResult) -> Self {
        self.fallback = Some(result);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Models requested so far, in call order.
    pub fn models_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ExtractionRequest> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn extract(
        &self,
        model: &str,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((model.to_string(), request.clone()));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match next {
            Some(outcome) => outcome,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Api {
                    status: 500,
                    message: "mock script exhausted".into(),
                }),
        }
    }
}
