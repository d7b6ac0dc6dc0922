//! Streaming completion gateway with a bounded retry policy.

pub mod error;
pub mod openai;
pub mod sse;
pub mod types;

use std::time::Duration;

use tokio::time::sleep;

use crate::prompts::build_messages;

pub use error::{ErrorContext, ProviderError};
pub use openai::{ChatStreamProvider, OpenAiCompatAdapter};
pub use sse::{Delta, Frame, FrameDecoder, StreamAccumulator};
pub use types::*;

/// Anything that can turn an instruction/input pair into a two-channel answer.
///
/// Never fails: exhausting retries yields [`StreamedCompletion::empty`].
#[async_trait::async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, instruction: &str, input: &str) -> StreamedCompletion;
}

/// Bounded retry policy.
///
/// Rate-limited attempts back off exponentially from `base_delay`; every other
/// failure waits `base_delay`. There is no wait after the final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (0-based) failed with `err`.
    pub fn delay_for(&self, err: &ProviderError, attempt: u32) -> Duration {
        if err.is_rate_limited() {
            backoff_delay(self.base_delay, attempt)
        } else {
            self.base_delay
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(6));
    base.saturating_mul(multiplier)
}

/// Retrying front for a [`ChatStreamProvider`].
pub struct StreamingGateway<P: ChatStreamProvider> {
    provider: P,
    model: String,
    temperature: f32,
    policy: RetryPolicy,
}

#[async_trait::async_trait]
impl<P: ChatStreamProvider> Completer for StreamingGateway<P> {
    async fn complete(&self, instruction: &str, input: &str) -> StreamedCompletion {
        StreamingGateway::call(self, instruction, input).await
    }
}

impl<P: ChatStreamProvider> StreamingGateway<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.6,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Stream one task through the provider, retrying per the policy.
    ///
    /// A response with both channels empty counts as a failed attempt.
    pub async fn call(&self, instruction: &str, input: &str) -> StreamedCompletion {
        let req = ChatRequest::new(&self.model, build_messages(instruction, input))
            .temperature(self.temperature);
        let attempts = self.policy.attempts();

        for attempt in 0..attempts {
            let err = match self.provider.stream_chat(&req).await {
                Ok(resp) if resp.completion.is_usable() => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        frames = resp.stats.frames,
                        malformed_frames = resp.stats.malformed_frames,
                        terminated = resp.stats.terminated,
                        latency_ms = resp.stats.latency.as_millis() as u64,
                        "Stream completed"
                    );
                    return resp.completion;
                }
                Ok(_) => ProviderError::EmptyResponse,
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::error!(code = err.code(), error = %err, "Streaming call failed permanently");
                break;
            }
            if attempt + 1 == attempts {
                tracing::warn!(
                    attempts,
                    code = err.code(),
                    status = ?err.http_status(),
                    error = %err,
                    "Retry budget exhausted; no usable output"
                );
                break;
            }

            let delay = self.policy.delay_for(&err, attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                code = err.code(),
                status = ?err.http_status(),
                request_id = ?err.request_id(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Streaming attempt failed; retrying"
            );
            sleep(delay).await;
        }

        StreamedCompletion::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_delays_double_and_others_stay_fixed() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let limited = ProviderError::rate_limited("slow down", ErrorContext::new());
        let other = ProviderError::provider_with_context("chat", "boom", ErrorContext::new());

        let waits: Vec<_> = (0..4).map(|a| policy.delay_for(&limited, a)).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        assert_eq!(policy.delay_for(&other, 3), Duration::from_millis(100));
    }

    #[test]
    fn backoff_exponent_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 6), backoff_delay(base, 30));
    }

    #[test]
    fn zero_attempts_still_makes_one_call() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
    }
}
