//! Anthropic-Compatible Messages Adapter
//!
//! Talks to the `/v1/messages` endpoint. The narrator instruction goes in
//! the top-level `system` field and messages must alternate roles starting
//! with `user`, so history is normalized before sending.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::prompt_utils::{self, ChatMessage, NARRATOR_SYSTEM_PROMPT};
use super::{
    AdapterError, ErrorClassifier, GeneratedContent, ProviderAdapter, ProviderConfig,
    build_http_client, check_input, validate_endpoint,
};
use crate::ai::timeout::with_timeout;
use crate::types::{Result, TaleError, Turn};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const API_VERSION: &str = "2023-06-01";
const STORY_OPENING: &str = "Begin the story.";

pub struct AnthropicAdapter {
    name: String,
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key(API_KEY_ENV).ok_or_else(|| {
            TaleError::Config(format!(
                "API key for provider '{}' not found. Set {} or provide api_key/api_key_env in config",
                config.name, API_KEY_ENV
            ))
        })?;

        let api_base = validate_endpoint(
            config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
            &config.name,
        )?;

        Ok(Self {
            name: config.name.clone(),
            api_key: SecretString::from(api_key),
            api_base,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_http_client(config.timeout())?,
        })
    }

    async fn send(
        &self,
        request: &MessagesRequest,
        prompt: &str,
        history: &[Turn],
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError> {
        let url = format!("{}/v1/messages", self.api_base);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = ErrorClassifier::parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            // 529 is Anthropic's "overloaded"; classify_http_status maps it with the 5xx range
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, timeout))?;

        let text: String = body
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let (tokens_in, tokens_out) = match body.usage {
            Some(usage) => (Some(usage.input_tokens), Some(usage.output_tokens)),
            None => (None, None),
        };

        let metadata = json!({
            "id": body.id,
            "model": body.model,
            "stop_reason": body.stop_reason,
        });

        Ok(
            GeneratedContent::from_response(text, tokens_in, tokens_out, prompt, history)?
                .with_metadata(metadata),
        )
    }
}

/// Merge consecutive same-role messages and make the first one a user turn
fn normalize_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut normalized: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 1);
    for message in messages {
        match normalized.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => normalized.push(message),
        }
    }
    if normalized.first().is_some_and(|m| m.role == "assistant") {
        normalized.insert(
            0,
            ChatMessage {
                role: "user",
                content: STORY_OPENING.to_string(),
            },
        );
    }
    normalized
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn generate(
        &self,
        prompt: &str,
        context_history: &[Turn],
        max_tokens: u32,
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError> {
        check_input(prompt, max_tokens, self.max_tokens)?;

        debug!(
            provider = %self.name,
            model = %self.model,
            history = context_history.len(),
            "Sending messages request"
        );

        let request = MessagesRequest {
            model: self.model.clone(),
            system: NARRATOR_SYSTEM_PROMPT,
            messages: normalize_messages(prompt_utils::build_chat_messages(
                prompt,
                context_history,
            )),
            max_tokens,
            temperature: self.temperature,
        };

        with_timeout(
            timeout,
            self.send(&request, prompt, context_history, timeout),
        )
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_tokens_ceiling(&self) -> u32 {
        self.max_tokens
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    system: &'static str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}
