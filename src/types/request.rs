//! Generation request input types.

use serde::{Deserialize, Serialize};

use super::{RequestId, UserId};

/// Who produced a turn in the story so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The reader's choice or input
    Player,
    /// A previously generated story beat
    Narrator,
}

/// One prior exchange in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn player(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Player,
            content: content.into(),
        }
    }

    pub fn narrator(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Narrator,
            content: content.into(),
        }
    }
}

/// Input of one narrative generation.
///
/// Built once and never mutated; fields are only reachable through accessors.
/// Shape validation (non-empty prompt, bounded history) happens in the router,
/// which knows the configured history limit.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    request_id: RequestId,
    prompt: String,
    context_history: Vec<Turn>,
    user_id: UserId,
    max_attempts: Option<usize>,
}

impl GenerationRequest {
    pub fn new(user_id: impl Into<UserId>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::generate(),
            prompt: prompt.into(),
            context_history: Vec::new(),
            user_id: user_id.into(),
            max_attempts: None,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.context_history = history;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn context_history(&self) -> &[Turn] {
        &self.context_history
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Caller-supplied bound on providers contacted; `None` means all configured
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}
