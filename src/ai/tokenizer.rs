//! Token Estimation
//!
//! Deterministic token approximations used when a provider omits usage
//! counts and for pre-flight cost estimates.
//!
//! ## Strategy
//! - `CharBased`: one token per four characters, rounded up. This is the
//!   documented fallback adapters use when flagging `estimated = true`.
//! - `WordBased`: 0.75 tokens per whitespace-separated word, plus one.

use crate::constants::provider as provider_constants;
use crate::types::Turn;

/// Token estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenEstimator {
    /// Simple character-based estimation (4 chars = 1 token)
    #[default]
    CharBased,
    /// Word-based estimation (0.75 tokens per word on average)
    WordBased,
}

/// Token counter for prompt budgeting
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter {
    estimator: TokenEstimator,
}

impl TokenCounter {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    /// Estimate token count for a string
    pub fn count(&self, text: &str) -> u32 {
        let tokens = match self.estimator {
            TokenEstimator::CharBased => count_char_based(text),
            TokenEstimator::WordBased => count_word_based(text),
        };
        u32::try_from(tokens).unwrap_or(u32::MAX)
    }

    /// Estimate input tokens for a prompt plus its conversation history
    pub fn count_request(&self, prompt: &str, history: &[Turn]) -> u32 {
        history
            .iter()
            .map(|turn| self.count(&turn.content))
            .fold(self.count(prompt), u32::saturating_add)
    }
}

fn count_char_based(text: &str) -> usize {
    text.chars()
        .count()
        .div_ceil(provider_constants::CHARS_PER_TOKEN)
}

fn count_word_based(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f32 * 0.75).ceil() as usize + 1
}

/// Character-based estimate used by adapters for missing usage fields
pub fn estimate_tokens(text: &str) -> u32 {
    TokenCounter::default().count(text)
}

/// Character-based estimate of a request's input tokens
pub fn estimate_request_tokens(prompt: &str, history: &[Turn]) -> u32 {
    TokenCounter::default().count_request(prompt, history)
}
