//! Ollama Local Model Adapter
//!
//! Uses the non-streaming `/api/chat` endpoint. Local models often omit
//! evaluation counts, in which case token usage is estimated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::prompt_utils::{self, ChatMessage};
use super::{
    AdapterError, ErrorClassifier, GeneratedContent, ProviderAdapter, ProviderConfig,
    build_http_client, check_input, validate_endpoint,
};
use crate::ai::timeout::with_timeout;
use crate::types::{Result, Turn};

const DEFAULT_API_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3:latest";

#[derive(Debug)]
pub struct OllamaAdapter {
    name: String,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_base = validate_endpoint(
            config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
            &config.name,
        )?;

        Ok(Self {
            name: config.name.clone(),
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
        request: &OllamaChatRequest,
        prompt: &str,
        history: &[Turn],
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError> {
        let url = format!("{}/api/chat", self.api_base);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &body,
                None,
            ));
        }

        let body: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, timeout))?;

        let metadata = json!({
            "model": body.model,
            "done_reason": body.done_reason,
        });

        Ok(GeneratedContent::from_response(
            body.message.content,
            body.prompt_eval_count,
            body.eval_count,
            prompt,
            history,
        )?
        .with_metadata(metadata))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn generate(
        &self,
        prompt: &str,
        context_history: &[Turn],
        max_tokens: u32,
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError> {
        check_input(prompt, max_tokens, self.max_tokens)?;

        debug!(provider = %self.name, model = %self.model, "Sending Ollama chat request");

        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: prompt_utils::with_system(prompt_utils::build_chat_messages(
                prompt,
                context_history,
            )),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: max_tokens,
            },
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
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::ProviderKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_default_config() {
        let config = ProviderConfig::new("local", ProviderKind::Ollama);
        let adapter = OllamaAdapter::new(&config).unwrap();
        assert_eq!(adapter.api_base, DEFAULT_API_BASE);
        assert_eq!(adapter.model, DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn test_generate_without_counts_is_estimated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"stream": false, "options": {"num_predict": 32}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3",
                "message": {"role": "assistant", "content": "A bridge. Cross? (Y/N)"},
                "done": true
            })))
            .mount(&server)
            .await;

        let mut config = ProviderConfig::new("local", ProviderKind::Ollama);
        config.api_base = Some(server.uri());
        let content = OllamaAdapter::new(&config)
            .unwrap()
            .generate("Walk", &[], 32, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(content.text, "A bridge. Cross? (Y/N)");
        assert!(content.estimated);
        assert_eq!(content.tokens_out, 6);
    }
}
