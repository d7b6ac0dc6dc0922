//! Core types for the streaming completion gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request for one streamed chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier, e.g. "deepseek-reasoner".
    pub model: String,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.6,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }
}

// =============================================================================
// STREAMED RESULT
// =============================================================================

/// The two channels accumulated from one streamed response.
///
/// `reasoning` and `answer` are kept apart all the way to output assembly;
/// nothing in the gateway concatenates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamedCompletion {
    /// Internal deliberation tokens (`reasoning_content` deltas).
    pub reasoning: String,
    /// Final answer tokens (`content` deltas).
    pub answer: String,
}

impl StreamedCompletion {
    pub fn new(reasoning: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            answer: answer.into(),
        }
    }

    /// The "no usable output" sentinel returned after the retry budget is spent.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Usable when at least one channel carried text.
    pub fn is_usable(&self) -> bool {
        !self.reasoning.is_empty() || !self.answer.is_empty()
    }
}

/// Result of one streamed attempt that reached end-of-stream.
#[derive(Debug, Clone)]
pub struct StreamedResponse {
    pub completion: StreamedCompletion,
    pub stats: StreamStats,
}

/// Per-attempt metadata reported alongside a successful stream.
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Data frames decoded (excluding the terminator).
    pub frames: usize,
    /// Frames that failed to parse and were skipped.
    pub malformed_frames: usize,
    /// Whether the `[DONE]` terminator was seen before end-of-body.
    pub terminated: bool,
    /// Wall-clock time of the attempt.
    pub latency: Duration,
}
