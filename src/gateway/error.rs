//! Error types for the streaming completion gateway.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors from a single streaming attempt.
///
/// None of these escape [`StreamingGateway::call`](super::StreamingGateway::call);
/// they only decide how long to wait before the next attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider returned a 429 response.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Non-success status or an error object in the body.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        context: Option<ErrorContext>,
    },

    /// The stream ended without any reasoning or answer text.
    #[error("empty response: stream carried no reasoning or answer tokens")]
    EmptyResponse,

    /// Request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// HTTP/network error, including failures mid-stream.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, bad header value, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Create a rate limited error from a provider 429.
    pub fn rate_limited(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::RateLimited {
            message: message.into(),
            context: Some(context),
        }
    }

    /// Create a provider error with context.
    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            context: Some(context),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the retry policy should use the rate-limit (exponential) delay.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether another attempt can possibly succeed.
    ///
    /// Every non-success status is retried with the fixed delay, matching the
    /// batch workload where a single bad gateway response should not lose a task.
    /// Only configuration errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Provider { .. } => true,
            Self::EmptyResponse => true,
            Self::Timeout(_) => true,
            Self::Http(_) => true,
            Self::Config(_) => false,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider { .. } => "provider_error",
            Self::EmptyResponse => "empty_response",
            Self::Timeout(_) => "timeout",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::EmptyResponse => None,
            Self::Timeout(_) => None,
            Self::Http(_) => None,
            Self::Config(_) => None,
        }
    }

    /// Get the HTTP status if the provider answered at all.
    pub fn http_status(&self) -> Option<u16> {
        self.context().and_then(|c| c.http_status)
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_permanent() {
        let server = ProviderError::provider_with_context(
            "chat",
            "HTTP 400: bad request",
            ErrorContext::new().with_status(400),
        );
        assert!(server.is_retryable());
        assert!(!server.is_rate_limited());
        assert_eq!(server.http_status(), Some(400));

        assert!(ProviderError::EmptyResponse.is_retryable());
        assert!(!ProviderError::config("missing key").is_retryable());
    }
}
