//! OpenAI-compatible completion client and the retrying gateway on top of it.
//!
//! `CompletionProvider` is the seam between orchestration and HTTP: the
//! production implementation is `OpenAiClient`, tests script their own.
//! `CompletionGateway` owns the request shape (tools, thinking parameters),
//! the rate-limit retry loop and the hand-off to the stream reconstructor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::reconstruct::{
    reconstruct, NullSink, ReconstructOptions, ResponseSink, StreamReconstructor,
};
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ChatMessage, CompletionResult, StreamDelta, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Total request timeout for streaming calls.
///
/// Thinking models can reason for minutes before the first visible token.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Provider seam ───────────────────────────────────────────────────────────

/// What a provider hands back for one request.
pub enum ProviderResponse {
    /// A complete, non-streamed response already folded into one delta.
    Full(StreamDelta),
    /// An incremental delta stream.
    Stream(BoxStream<'static, Result<StreamDelta, InferenceError>>),
}

/// A chat completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ProviderResponse, InferenceError>;
}

// ─── OpenAiClient ────────────────────────────────────────────────────────────

/// Client for any endpoint speaking the OpenAI chat completions protocol
/// (Ollama, LM Studio, Cerebras, hosted OpenAI-compatible services).
pub struct OpenAiClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer timeout).
    http_stream: HttpClient,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build a client. Does NOT check connectivity; see [`Self::health_check`].
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, InferenceError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "provider base_url is empty".into(),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the endpoint is reachable. Does not consume inference tokens.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);

        match self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "health check request failed");
                false
            }
        }
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error, timeout: Duration) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout.as_secs(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ProviderResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let (http, timeout) = if request.stream {
            (&self.http_stream, STREAM_REQUEST_TIMEOUT)
        } else {
            (&self.http, REQUEST_TIMEOUT)
        };

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            url = %url,
            model = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            stream = request.stream,
            "sending completion request"
        );

        let mut builder = http.post(&url).bearer_auth(&self.api_key).json(&request);
        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status.as_u16(), body_text));
        }

        if request.stream {
            return Ok(ProviderResponse::Stream(parse_sse_stream(response).boxed()));
        }

        let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;
        parse_non_streaming_response(&body_text).map(ProviderResponse::Full)
    }
}

// ─── CompletionGateway ───────────────────────────────────────────────────────

/// Bounded exponential backoff for rate-limit responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles on each further one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based count of failures so far).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Per-request parameters that do not change between calls.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub model: String,
    pub stream: bool,
    pub max_completion_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
}

/// Wraps a provider with request building, retry and reconstruction.
pub struct CompletionGateway {
    provider: Arc<dyn CompletionProvider>,
    tools: Vec<ToolDefinition>,
    options: RequestOptions,
    retry: RetryPolicy,
    reconstruct: ReconstructOptions,
}

impl CompletionGateway {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tools: Vec<ToolDefinition>,
        options: RequestOptions,
        retry: RetryPolicy,
        reconstruct: ReconstructOptions,
    ) -> Self {
        Self {
            provider,
            tools,
            options,
            retry,
            reconstruct,
        }
    }

    /// Build the request body for a conversation snapshot.
    fn build_request(&self, messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        let has_tools = !self.tools.is_empty();
        // Reasoning parameters only mean something to thinking models.
        let thinking = self.reconstruct.thinking_model;

        ChatCompletionRequest {
            model: self.options.model.clone(),
            messages,
            tools: has_tools.then(|| self.tools.clone()),
            tool_choice: has_tools.then(|| "auto".to_string()),
            stream: self.options.stream,
            max_completion_tokens: self.options.max_completion_tokens.filter(|_| thinking),
            reasoning_effort: self.options.reasoning_effort.clone().filter(|_| thinking),
        }
    }

    /// Run one completion call to its finalized result.
    ///
    /// Rate-limit failures are retried with exponential backoff; anything else
    /// propagates immediately. Exhausting the attempts returns the last
    /// rate-limit error.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        sink: &mut dyn ResponseSink,
    ) -> Result<CompletionResult, InferenceError> {
        let request = self.build_request(messages);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        let response = loop {
            match self.provider.complete(request.clone()).await {
                Ok(response) => break response,
                Err(e) if e.is_rate_limited() && attempt + 1 < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        tracing::error!(attempts = max_attempts, error = %e, "rate limit retries exhausted");
                    }
                    return Err(e);
                }
            }
        };

        match response {
            ProviderResponse::Stream(deltas) => {
                reconstruct(deltas, self.reconstruct.clone(), sink).await
            }
            ProviderResponse::Full(delta) => {
                // Same extraction path as a stream of exactly one delta. Nothing
                // is forwarded incrementally; the caller sends the final text.
                let mut reconstructor = StreamReconstructor::new(self.reconstruct.clone());
                reconstructor.push(delta, &mut NullSink);
                Ok(reconstructor.finish(&mut NullSink))
            }
        }
    }

    /// Attempts this gateway makes before giving up on a rate limit.
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts.max(1)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
