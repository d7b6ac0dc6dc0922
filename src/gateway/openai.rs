//! Streaming adapter for OpenAI-compatible chat completion endpoints.
//!
//! Targets reasoning models that emit `reasoning_content` deltas next to the
//! usual `content` deltas (DeepSeek R1 style).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::sse::{FrameDecoder, StreamAccumulator};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// One streamed attempt against a chat completion endpoint.
///
/// Implementations do not retry; [`StreamingGateway`](super::StreamingGateway)
/// owns the retry policy.
#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    async fn stream_chat(&self, req: &ChatRequest) -> Result<StreamedResponse, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

const CHAT_PATH: &str = "/chat/completions";

/// Maximum streamed body size (16MB). Reasoning traces get long.
const MAX_RESPONSE_LEN: usize = 16 * 1_024 * 1_024;

/// Maximum error body retained for messages.
const MAX_ERROR_BODY: usize = 4 * 1_024;

#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenAiCompatAdapter {
    /// Create from API key with the default endpoint and timeout.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .map_err(|_| ProviderError::config("DEEPSEEK_API_KEY not set"))?;

        let base_url =
            std::env::var("DISTILL_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("DISTILL_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(api_key, base_url, timeout)
    }

    /// Create with custom configuration. `timeout` bounds each attempt,
    /// including reading the whole stream.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Accepts either a base URL or the full `/chat/completions` URL.
    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with(CHAT_PATH) {
            base.to_string()
        } else {
            format!("{base}{CHAT_PATH}")
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Http(err)
        }
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    temperature: f32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

// =============================================================================
// PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatStreamProvider for OpenAiCompatAdapter {
    async fn stream_chat(&self, req: &ChatRequest) -> Result<StreamedResponse, ProviderError> {
        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            stream: true,
            temperature: req.temperature,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match Self::extract_request_id(response.headers()) {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let mut bytes = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
                let room = MAX_ERROR_BODY.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if room <= chunk.len() {
                    break;
                }
            }
            let body = String::from_utf8_lossy(&bytes).to_string();

            let (message, ctx) = match serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error)
            {
                Some(error) => {
                    let ctx = match error.code {
                        Some(serde_json::Value::String(code)) => ctx.with_code(code),
                        Some(other) if !other.is_null() => ctx.with_code(other.to_string()),
                        _ => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None if body.trim().is_empty() => (format!("HTTP {}", status.as_u16()), ctx),
                None => (body.trim().to_string(), ctx),
            };

            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(message, ctx),
                code => ProviderError::provider_with_context(
                    "chat",
                    format!("HTTP {code}: {message}"),
                    ctx,
                ),
            });
        }

        let mut decoder = FrameDecoder::new();
        let mut acc = StreamAccumulator::new();
        let mut received = 0usize;

        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            received += chunk.len();
            if received > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider_with_context(
                    "chat",
                    format!("Response too large: {received} bytes"),
                    ctx,
                ));
            }
            decoder.push(&chunk);
            if !acc.drain(&mut decoder) {
                break;
            }
        }

        if !acc.is_done() {
            decoder.finish();
            acc.drain(&mut decoder);
        }

        let stats = StreamStats {
            frames: acc.frames(),
            malformed_frames: acc.malformed(),
            terminated: acc.is_done(),
            latency: start.elapsed(),
        };

        Ok(StreamedResponse {
            completion: acc.into_completion(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_accepts_base_or_full_endpoint() {
        let base = OpenAiCompatAdapter::with_config("sk", "https://api.example.com/", DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(base.chat_url(), "https://api.example.com/chat/completions");

        let full = OpenAiCompatAdapter::with_config(
            "sk",
            "https://api.example.com/chat/completions",
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(full.chat_url(), "https://api.example.com/chat/completions");
    }

    #[test]
    fn rejects_api_key_that_is_not_a_valid_header() {
        let err = OpenAiCompatAdapter::with_config("sk-\n", DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
