//! HTTP chat backend.
//!
//! Both LLM touchpoints in the pipeline are single-turn: the generator
//! sends one grounded QA prompt per candidate, the judge sends one rubric
//! prompt per verification. `ChatClient` therefore exposes a deliberately
//! narrow surface: submit one request, get back the one completion that
//! matters. Gateway quirks (rate limits, flaky upstreams, decorated JSON)
//! are absorbed here so the generator and judge never see transport
//! detail.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::LlmError;

/// Attempts per request before the transport error surfaces.
const RETRY_ATTEMPTS: u32 = 3;

/// First backoff between attempts; doubles each time, plus jitter.
const INITIAL_BACKOFF: Duration = Duration::from_millis(400);

/// Ceiling on a single HTTP round-trip. Callers enforce their own
/// tighter per-call deadlines on top of this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(90);

/// Longest slice of an unparseable error body kept for diagnostics.
const ERROR_SNIPPET_LEN: usize = 200;

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Anything else a backend invents; never produced by this pipeline.
    #[serde(other)]
    Other,
}

/// A single chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// A system turn, used for judge rubric framing.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user turn, the carrier for QA and rubric prompts.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One chat call: a prompt plus the sampling knobs the candidate
/// schedule or the judge pins for it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier; empty means the client's configured model.
    pub model: String,
    /// Conversation turns, usually a single user prompt.
    pub messages: Vec<Message>,
    /// Sampling temperature; the candidate schedule varies this per slot,
    /// the judge pins it to zero.
    pub temperature: Option<f64>,
    /// Nucleus sampling mass, when a profile perturbs it.
    pub top_p: Option<f64>,
    /// Completion budget.
    pub max_tokens: Option<u32>,
    /// Sampling seed for reproducible candidates.
    pub seed: Option<u64>,
}

impl ChatRequest {
    /// Builds a request with no sampling overrides.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            seed: None,
        }
    }

    /// Pins the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Pins the nucleus sampling mass.
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Caps the completion length.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Fixes the sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// The completion the pipeline consumes, flattened from the backend's
/// choice list. Multi-choice responses keep only the first choice; the
/// pipeline induces answer variance through sampling profiles, not
/// through n-best lists.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Model that served the call, as reported by the backend.
    pub model: String,
    /// Completion text.
    pub text: String,
    /// Why generation stopped, when the backend says.
    pub finish_reason: Option<String>,
}

/// Trait for chat completion backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Runs one chat call to completion.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Chat client for OpenAI-compatible gateways.
pub struct ChatClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl ChatClient {
    /// Creates a client against `base_url` (e.g. "http://localhost:11434/v1").
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            base_url,
            api_key,
            model,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Creates a client from the environment:
    ///
    /// - `LLM_API_BASE` (required)
    /// - `LLM_API_KEY` (optional)
    /// - `LLM_MODEL` (defaults to "llama3.2:3b")
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if `LLM_API_BASE` is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        let base_url = env::var("LLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LLM_API_KEY").ok();
        let model = env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string());

        Ok(Self::new(base_url, api_key, model))
    }

    /// The configured gateway base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The model used when a request leaves its model empty.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_once(&self, url: &str, body: &WireRequest<'_>) -> Result<ChatResponse, LlmError> {
        let mut call = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited(error_detail(&payload)));
        }
        if !status.is_success() {
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message: error_detail(&payload),
            });
        }

        parse_completion(&payload)
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let model = if request.model.is_empty() {
            self.model.as_str()
        } else {
            request.model.as_str()
        };

        let body = WireRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            seed: request.seed,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let mut attempts_left = RETRY_ATTEMPTS;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.send_once(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempts_left > 1 => {
                    attempts_left -= 1;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tracing::warn!(
                        model,
                        attempts_left,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Chat call failed, backing off"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Request body in the gateway's wire shape. Borrows from the
/// [`ChatRequest`] so nothing is cloned per attempt.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

/// Success body, decoded tolerantly: gateways differ in which optional
/// fields they bother to send.
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Decodes a success body down to the first completion.
fn parse_completion(payload: &str) -> Result<ChatResponse, LlmError> {
    let wire: WireResponse = serde_json::from_str(payload).map_err(|e| {
        LlmError::ParseError(format!("completion body did not match the chat schema: {e}"))
    })?;

    if let Some(usage) = &wire.usage {
        tracing::debug!(
            model = %wire.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Chat completion received"
        );
    }

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ParseError("completion body held no choices".to_string()))?;

    Ok(ChatResponse {
        model: wire.model,
        text: choice.message.content,
        finish_reason: choice.finish_reason,
    })
}

/// Pulls the human-readable message out of an error body, falling back
/// to a trimmed snippet of whatever the gateway sent.
fn error_detail(payload: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorInner,
    }
    #[derive(Deserialize)]
    struct ErrorInner {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(payload) {
        Ok(body) => body.error.message,
        Err(_) => {
            let trimmed = payload.trim();
            match trimmed.char_indices().nth(ERROR_SNIPPET_LEN) {
                Some((idx, _)) => trimmed[..idx].to_string(),
                None => trimmed.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");

        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);

        // Unknown roles from exotic gateways land in the catch-all.
        let role: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(role, Role::Other);
    }

    #[test]
    fn test_message_constructors() {
        let turn = Message::system("score strictly");
        assert_eq!(turn.role, Role::System);

        let turn = Message::user("What is a load balancer?");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "What is a load balancer?");
    }

    #[test]
    fn test_chat_request_builder() {
        let request = ChatRequest::new("llama3.2:3b", vec![Message::user("hi")])
            .with_temperature(0.2)
            .with_top_p(0.9)
            .with_max_tokens(256)
            .with_seed(7);

        assert_eq!(request.model, "llama3.2:3b");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.top_p, Some(0.9));
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.seed, Some(7));
    }

    #[test]
    fn test_wire_request_omits_unset_knobs() {
        let messages = vec![Message::user("hi")];
        let body = WireRequest {
            model: "m",
            messages: &messages,
            temperature: Some(0.7),
            top_p: None,
            max_tokens: None,
            seed: None,
        };

        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["temperature"], 0.7);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("top_p").is_none());
        assert!(json.get("seed").is_none());
    }

    #[test]
    fn test_parse_completion_flattens_first_choice() {
        let payload = r#"{
            "id": "cmpl-1",
            "model": "llama3.2:3b",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "An answer."}, "finish_reason": "stop"},
                {"index": 1, "message": {"role": "assistant", "content": "ignored"}}
            ],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;

        let response = parse_completion(payload).expect("parse");
        assert_eq!(response.model, "llama3.2:3b");
        assert_eq!(response.text, "An answer.");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_completion_rejects_empty_choices() {
        let err = parse_completion(r#"{"model": "m", "choices": []}"#).expect_err("no choices");
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[test]
    fn test_parse_completion_rejects_garbage() {
        let err = parse_completion("<html>bad gateway</html>").expect_err("not json");
        assert!(matches!(err, LlmError::ParseError(_)));
    }

    #[test]
    fn test_error_detail_prefers_structured_message() {
        let detail = error_detail(r#"{"error": {"message": "model not found", "type": "invalid"}}"#);
        assert_eq!(detail, "model not found");
    }

    #[test]
    fn test_error_detail_falls_back_to_snippet() {
        let detail = error_detail(&format!("  {}  ", "x".repeat(500)));
        assert_eq!(detail.len(), ERROR_SNIPPET_LEN);
    }

    #[test]
    fn test_client_accessors() {
        let client = ChatClient::new("http://localhost:11434/v1".into(), None, "m".into());
        assert_eq!(client.base_url(), "http://localhost:11434/v1");
        assert_eq!(client.model(), "m");
    }
}
