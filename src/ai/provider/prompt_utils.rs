//! Chat message construction shared by the HTTP adapters.
//!
//! Story history maps onto chat roles: player turns become `user`
//! messages, narrator turns become `assistant` messages, and the prompt is
//! always the final `user` message.

use serde::Serialize;

use crate::types::{Turn, TurnRole};

/// Fixed instruction given to every provider
pub const NARRATOR_SYSTEM_PROMPT: &str = "You are the narrator of an interactive text adventure. \
Continue the story in plain prose without emoji. End every reply with a yes/no choice \
marked \"(Y/N)\", or with \"(Restart?)\" when the story has ended.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Map history and prompt to chat messages, without the system instruction.
///
/// Anthropic takes the system prompt as a top-level field, so callers
/// that need it inline prepend it themselves via [`with_system`].
pub fn build_chat_messages(prompt: &str, history: &[Turn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    for turn in history {
        let role = match turn.role {
            TurnRole::Player => "user",
            TurnRole::Narrator => "assistant",
        };
        messages.push(ChatMessage::new(role, turn.content.as_str()));
    }
    messages.push(ChatMessage::new("user", prompt));
    messages
}

/// Prepend the narrator instruction as a `system` message
pub fn with_system(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages.insert(0, ChatMessage::new("system", NARRATOR_SYSTEM_PROMPT));
    messages
}
