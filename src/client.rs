use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::{future, Future, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, RewriteError};
use crate::prompt;

/// OpenAI-compatible base URL used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1";

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Rewrite the text you are given. Keep its meaning, language and tone. \
Reply with the rewritten text only.";

/// Payload of the end-of-stream frame.
pub const DONE_MARKER: &str = "[DONE]";

/// Configuration for completion requests.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Base URL of an OpenAI-compatible API (`/chat/completions` is appended).
    pub endpoint: String,

    /// Bearer credential. Missing keys fail with an auth error before sending.
    pub api_key: Option<String>,

    pub model: String,

    /// System instruction sent ahead of every unit.
    pub system_prompt: String,

    /// User message template; `{input}` is replaced by the source text.
    pub user_template: String,

    /// Sampling temperature, 0.0..=2.0.
    pub temperature: f64,

    /// Maximum output tokens, 1..=4000.
    pub max_tokens: u32,

    /// Nucleus sampling, 0.0 < p <= 1.0.
    pub top_p: Option<f64>,

    /// Repetition penalty, 0.0 < r <= 2.0.
    pub repetition_penalty: Option<f64>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: prompt::INPUT_PLACEHOLDER.to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            top_p: None,
            repetition_penalty: None,
        }
    }
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("repetition_penalty", &self.repetition_penalty)
            .finish()
    }
}

impl CompletionConfig {
    /// Defaults overlaid with `REWRITE_API_KEY`, `REWRITE_ENDPOINT` and
    /// `REWRITE_MODEL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("REWRITE_API_KEY") {
            config.api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("REWRITE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("REWRITE_MODEL") {
            config.model = model;
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f64) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    /// Check parameter bounds. Runs before every attempt so a bad config
    /// fails without a network call.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RewriteError::InvalidConfig("endpoint is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(RewriteError::InvalidConfig("model is empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RewriteError::InvalidConfig(format!(
                "temperature {} outside 0..=2",
                self.temperature
            )));
        }
        if !(1..=4000).contains(&self.max_tokens) {
            return Err(RewriteError::InvalidConfig(format!(
                "max_tokens {} outside 1..=4000",
                self.max_tokens
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(RewriteError::InvalidConfig(format!(
                    "top_p {} outside (0, 1]",
                    top_p
                )));
            }
        }
        if let Some(penalty) = self.repetition_penalty {
            if !(penalty > 0.0 && penalty <= 2.0) {
                return Err(RewriteError::InvalidConfig(format!(
                    "repetition_penalty {} outside (0, 2]",
                    penalty
                )));
            }
        }
        Ok(())
    }
}

/// Everything a backend needs to open one completion stream.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub job_id: String,
    pub source_text: String,
    pub config: CompletionConfig,
}

/// One decoded frame of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text to append to the result.
    Delta(String),
    /// Explicit end of stream.
    Done,
}

pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Source of completion streams.
///
/// [`HttpBackend`] talks to a remote OpenAI-compatible API; tests and
/// embedders can provide their own.
pub trait CompletionBackend: Send + Sync + 'static {
    /// Open a stream for `request`. Errors returned here (connection, status,
    /// credential) fail the attempt before any frame is read.
    fn open(&self, request: CompletionRequest) -> impl Future<Output = Result<FrameStream>> + Send;
}

/// Streams completions from `{endpoint}/chat/completions` over SSE.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom `reqwest::Client` (proxies, TLS, connect timeouts). Do not
    /// give it an overall request timeout: streams are long-lived and the
    /// queue enforces a per-frame timeout instead.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl CompletionBackend for HttpBackend {
    async fn open(&self, request: CompletionRequest) -> Result<FrameStream> {
        let api_key = request
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| RewriteError::Auth("no API key configured".to_string()))?;

        let url = format!(
            "{}/chat/completions",
            request.config.endpoint.trim_end_matches('/')
        );
        let body = build_body(&request);

        debug!(job_id = %request.job_id, model = %request.config.model, url = %url, "Opening completion stream");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| RewriteError::Network(format!("Failed to connect to {}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &text));
        }

        let frames = resp.bytes_stream().eventsource().filter_map(|event| {
            future::ready(match event {
                Ok(event) => parse_frame(&event.data).transpose(),
                Err(e) => Some(Err(RewriteError::Network(format!(
                    "Stream read failed: {}",
                    e
                )))),
            })
        });

        Ok(frames.boxed())
    }
}

/// Request body for a streaming chat completion.
pub fn build_body(request: &CompletionRequest) -> Value {
    let config = &request.config;
    let messages = prompt::build_messages(
        &config.system_prompt,
        &config.user_template,
        &request.source_text,
    );

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": true,
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
    });

    if let Some(top_p) = config.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(penalty) = config.repetition_penalty {
        body["repetition_penalty"] = json!(penalty);
    }
    body
}

/// Decode one SSE `data:` payload.
///
/// Returns `Ok(None)` for keep-alive or content-free chunks (role headers,
/// usage trailers).
pub fn parse_frame(data: &str) -> Result<Option<Frame>> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_MARKER {
        return Ok(Some(Frame::Done));
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| RewriteError::Parse(format!("{} in frame: {}", e, preview(data))))?;

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let status = err
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(500);
        return Err(classify_status(status, None, message));
    }

    let choices = value
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| RewriteError::Parse(format!("frame has no choices: {}", preview(data))))?;

    let delta = choices
        .first()
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if delta.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Frame::Delta(delta.to_string())))
    }
}

/// Map a non-2xx status onto the error taxonomy.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> RewriteError {
    match status {
        401 | 403 => RewriteError::Auth(format!("HTTP {}: {}", status, preview(body))),
        429 => RewriteError::RateLimited { retry_after },
        _ => RewriteError::Api {
            status,
            body: preview(body).to_string(),
        },
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn request() -> CompletionRequest {
        CompletionRequest {
            job_id: "p1".into(),
            source_text: "The quick brown fox.".into(),
            config: CompletionConfig::default()
                .with_model("test-model")
                .with_system_prompt("Rewrite formally."),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = CompletionConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 1000);
        assert!(config.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = CompletionConfig::default().with_api_key("sk-secret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_validate_bounds() {
        let base = CompletionConfig::default();
        assert!(base.clone().with_temperature(2.0).validate().is_ok());
        assert!(base.clone().with_temperature(2.1).validate().is_err());
        assert!(base.clone().with_temperature(f64::NAN).validate().is_err());
        assert!(base.clone().with_max_tokens(0).validate().is_err());
        assert!(base.clone().with_max_tokens(4000).validate().is_ok());
        assert!(base.clone().with_max_tokens(4001).validate().is_err());
        assert!(base.clone().with_top_p(0.0).validate().is_err());
        assert!(base.clone().with_top_p(1.0).validate().is_ok());
        assert!(base.clone().with_repetition_penalty(2.5).validate().is_err());
        assert!(base.clone().with_model(" ").validate().is_err());
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: CompletionConfig =
            serde_json::from_str(r#"{"model": "m", "temperature": 0.2}"#).unwrap();
        assert_eq!(config.model, "m");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_tokens, 1000);
    }

    #[test]
    fn test_build_body() {
        let mut req = request();
        req.config = req.config.with_top_p(0.9);
        let body = build_body(&req);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["top_p"], 0.9);
        assert!(body.get("repetition_penalty").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Rewrite formally.");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "The quick brown fox.");
    }

    #[test]
    fn test_parse_frame_delta() {
        let frame = parse_frame(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(frame, Some(Frame::Delta("Hel".into())));
    }

    #[test]
    fn test_parse_frame_done() {
        assert_eq!(parse_frame("[DONE]").unwrap(), Some(Frame::Done));
    }

    #[test]
    fn test_parse_frame_skips_empty_chunks() {
        assert_eq!(parse_frame("").unwrap(), None);
        assert_eq!(
            parse_frame(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_frame(r#"{"choices":[],"usage":{}}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_frame_malformed() {
        let err = parse_frame("{not json").unwrap_err();
        assert!(matches!(err, RewriteError::Parse(_)));
        let err = parse_frame(r#"{"id":"x"}"#).unwrap_err();
        assert!(matches!(err, RewriteError::Parse(_)));
    }

    #[test]
    fn test_parse_frame_error_payload() {
        let err = parse_frame(r#"{"error":{"code":429,"message":"slow down"}}"#).unwrap_err();
        assert!(matches!(err, RewriteError::RateLimited { .. }));
        let err = parse_frame(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(matches!(err, RewriteError::Api { status: 500, .. }));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(401, None, "bad key"),
            RewriteError::Auth(_)
        ));
        assert!(matches!(
            classify_status(403, None, ""),
            RewriteError::Auth(_)
        ));
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(3)), ""),
            RewriteError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            classify_status(503, None, "unavailable"),
            RewriteError::Api { status: 503, .. }
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        assert_eq!(preview(&long).chars().count(), 200);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_sending() {
        let backend = HttpBackend::new();
        let result = backend
            .open(CompletionRequest {
                config: CompletionConfig::default().with_endpoint("http://127.0.0.1:9"),
                ..request()
            })
            .await;
        assert!(matches!(result, Err(RewriteError::Auth(_))));
    }
}
