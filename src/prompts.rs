//! Prompt assembly and output wrapping.
//!
//! Domain logic for turning a task into a two-message exchange and the two
//! streamed channels back into a single tagged output string.

use serde::{Deserialize, Serialize};

use crate::gateway::{Message, StreamedCompletion};

/// System message sent with every request.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const INSTRUCTION_TOKEN: &str = "{instruction}";
const INPUT_TOKEN: &str = "{input}";

/// Join instruction and input into the user message.
///
/// Both parts are trimmed; a blank line separates them only when both are
/// non-empty.
pub fn user_message(instruction: &str, input: &str) -> String {
    let instruction = instruction.trim();
    let input = input.trim();
    match (instruction.is_empty(), input.is_empty()) {
        (false, false) => format!("{instruction}\n\n{input}"),
        (false, true) => instruction.to_string(),
        (true, _) => input.to_string(),
    }
}

/// The fixed system + user exchange for one task.
pub fn build_messages(instruction: &str, input: &str) -> Vec<Message> {
    vec![
        Message::system(SYSTEM_PROMPT),
        Message::user(user_message(instruction, input)),
    ]
}

/// Wrap the two channels as `<think>…</think> <answer>…</answer>`.
pub fn format_output(completion: &StreamedCompletion) -> String {
    format!(
        "<think>{}</think> <answer>{}</answer>",
        completion.reasoning, completion.answer
    )
}

/// An instruction template used by comparison and distillation runs.
///
/// The template text replaces the task's instruction. `{instruction}` and
/// `{input}` are substituted with the task's own fields; when the template
/// consumes `{input}` the input is not appended a second time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptTemplate {
    pub text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Render into the `(instruction, input)` pair sent to the gateway.
    pub fn render(&self, instruction: &str, input: &str) -> (String, String) {
        let consumes_input = self.text.contains(INPUT_TOKEN);
        let rendered = self
            .text
            .replace(INSTRUCTION_TOKEN, instruction)
            .replace(INPUT_TOKEN, input);
        if consumes_input {
            (rendered, String::new())
        } else {
            (rendered, input.to_string())
        }
    }

    pub fn hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}
