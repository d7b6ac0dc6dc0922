//! Pull-based decoder for `text/event-stream` chat completion bodies.
//!
//! Bytes go in through [`FrameDecoder::push`] in whatever pieces the transport
//! delivers; complete frames come out of [`FrameDecoder::next_frame`]. Lines
//! are only decoded once their terminating newline has arrived, so chunk
//! boundaries inside a multi-byte character are harmless.

use serde::Deserialize;

use super::types::StreamedCompletion;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Token deltas carried by one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub reasoning: Option<String>,
    pub content: Option<String>,
}

/// One decoded server-sent event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data frame with zero, one, or both channel deltas.
    Delta(Delta),
    /// The `data: [DONE]` terminator.
    Done,
    /// A data frame whose payload was not valid completion-chunk JSON.
    Malformed(String),
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

// =============================================================================
// DECODER
// =============================================================================

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw body bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Mark end-of-body so a final line without a trailing newline is decoded.
    pub fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            if !self.buf.is_empty() && self.buf.last() != Some(&b'\n') {
                self.buf.push(b'\n');
            }
        }
    }

    /// Pop the next complete frame, skipping blank, comment and non-data lines.
    ///
    /// Returns `None` when no complete line is buffered yet.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = parse_line(line.trim()) {
                return Some(frame);
            }
        }
        None
    }

    /// Bytes buffered but not yet part of a complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn parse_line(line: &str) -> Option<Frame> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(Frame::Done);
    }

    match serde_json::from_str::<ChunkPayload>(payload) {
        Ok(chunk) => {
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .map(|d| Delta {
                    reasoning: d.reasoning_content.filter(|s| !s.is_empty()),
                    content: d.content.filter(|s| !s.is_empty()),
                })
                .unwrap_or_default();
            Some(Frame::Delta(delta))
        }
        Err(e) => Some(Frame::Malformed(e.to_string())),
    }
}

// =============================================================================
// ACCUMULATOR
// =============================================================================

/// Folds frames into the two channel buffers, in arrival order.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    completion: StreamedCompletion,
    frames: usize,
    malformed: usize,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame. Returns `false` once the terminator has been seen.
    pub fn apply(&mut self, frame: Frame) -> bool {
        if self.done {
            return false;
        }
        match frame {
            Frame::Delta(delta) => {
                self.frames += 1;
                if let Some(r) = delta.reasoning {
                    self.completion.reasoning.push_str(&r);
                }
                if let Some(c) = delta.content {
                    self.completion.answer.push_str(&c);
                }
                true
            }
            Frame::Malformed(reason) => {
                self.malformed += 1;
                tracing::debug!(reason = %reason, "Skipping malformed stream frame");
                true
            }
            Frame::Done => {
                self.done = true;
                false
            }
        }
    }

    /// Drain every complete frame out of `decoder`. Returns `false` once done.
    pub fn drain(&mut self, decoder: &mut FrameDecoder) -> bool {
        while let Some(frame) = decoder.next_frame() {
            if !self.apply(frame) {
                return false;
            }
        }
        !self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn into_completion(self) -> StreamedCompletion {
        self.completion
    }
}
