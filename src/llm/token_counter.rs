//! Token estimation per provider.
//!
//! Neither provider tokenizer is available offline, so counts are character
//! based: Anthropic models average ~3.8 chars/token, OpenAI and unknown models
//! are estimated at 4 chars/token.

use super::catalog::{lookup, Provider};
use super::ChatMessage;

const ANTHROPIC_CHARS_PER_TOKEN: f64 = 3.8;
const DEFAULT_CHARS_PER_TOKEN: usize = 4;
/// Per-message framing overhead (role, separators).
const MESSAGE_OVERHEAD: u64 = 4;
/// Overhead for the message list as a whole.
const CONVERSATION_OVERHEAD: u64 = 3;
const UNKNOWN_CONTEXT_WINDOW: u64 = 100_000;
const UNKNOWN_MAX_OUTPUT: u64 = 8192;

/// Stateless token counter. Cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    /// Estimate tokens in `text` for `model` (catalog key or model id).
    pub fn count_tokens(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        match lookup(model).map(|m| m.provider) {
            Some(Provider::Anthropic) => (chars as f64 / ANTHROPIC_CHARS_PER_TOKEN) as u64,
            Some(Provider::OpenAi) | None => (chars / DEFAULT_CHARS_PER_TOKEN) as u64,
        }
    }

    /// Token count for a whole conversation including framing overhead.
    pub fn count_messages_tokens(&self, messages: &[ChatMessage], model: &str) -> u64 {
        let body: u64 = messages
            .iter()
            .map(|m| {
                let content = m.text_content().map_or(0, |c| self.count_tokens(c, model));
                let calls = m.tool_calls.as_ref().map_or(0, |calls| {
                    calls
                        .iter()
                        .map(|c| self.count_tokens(&c.function.arguments, model))
                        .sum()
                });
                content + calls + MESSAGE_OVERHEAD
            })
            .sum();
        body + CONVERSATION_OVERHEAD
    }

    /// Worst-case tokens for one request: conversation, system prompt and full output allowance.
    pub fn estimate_request(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        max_output_tokens: u32,
        model: &str,
    ) -> u64 {
        let system = system.map_or(0, |s| self.count_tokens(s, model));
        self.count_messages_tokens(messages, model) + system + u64::from(max_output_tokens)
    }

    /// Whether `text` fits the model's context after reserving output space.
    pub fn fits_in_context(&self, text: &str, model: &str, reserved_output_tokens: u64) -> bool {
        let window = lookup(model)
            .map(|m| m.context_window as u64)
            .unwrap_or(UNKNOWN_CONTEXT_WINDOW);
        self.count_tokens(text, model) <= window.saturating_sub(reserved_output_tokens)
    }

    /// Output tokens left for a prompt of `input_tokens`, capped at the model's max output.
    pub fn get_available_output_tokens(&self, input_tokens: u64, model: &str) -> u64 {
        let (window, max_output) = lookup(model)
            .map(|m| (m.context_window as u64, m.max_output_tokens as u64))
            .unwrap_or((UNKNOWN_CONTEXT_WINDOW, UNKNOWN_MAX_OUTPUT));
        window.saturating_sub(input_tokens).min(max_output)
    }

    /// USD estimate from catalog prices. Unknown models cost 0.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
        match lookup(model) {
            Some(m) => m.cost(input_tokens, output_tokens),
            None => {
                tracing::warn!("Unknown model {}, cannot estimate cost", model);
                0.0
            }
        }
    }
}
