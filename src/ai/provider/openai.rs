//! OpenAI-Compatible Chat Completions Adapter
//!
//! Works against api.openai.com and any service exposing the same
//! `/chat/completions` contract.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
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
use crate::types::{Result, TaleError, Turn};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI adapter with secure API key handling
pub struct OpenAiAdapter {
    name: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("name", &self.name)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiAdapter {
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

    fn build_request(&self, prompt: &str, history: &[Turn], max_tokens: u32) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: prompt_utils::with_system(prompt_utils::build_chat_messages(
                prompt, history,
            )),
            temperature: self.temperature,
            max_tokens,
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        prompt: &str,
        history: &[Turn],
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError> {
        let url = format!("{}/chat/completions", self.api_base);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .bearer_auth(self.api_key.expose_secret())
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
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ErrorClassifier::classify_transport(&e, timeout))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::malformed("no choices in response"))?;
        let text = choice.message.content.unwrap_or_default();

        let (tokens_in, tokens_out) = match body.usage {
            Some(usage) => (Some(usage.prompt_tokens), Some(usage.completion_tokens)),
            None => (None, None),
        };

        let metadata = json!({
            "id": body.id,
            "model": body.model,
            "finish_reason": choice.finish_reason,
        });

        Ok(
            GeneratedContent::from_response(text, tokens_in, tokens_out, prompt, history)?
                .with_metadata(metadata),
        )
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
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
            "Sending chat completion request"
        );

        let request = self.build_request(prompt, context_history, max_tokens);
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
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{ErrorCategory, ProviderKind};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAiAdapter {
        let mut config = ProviderConfig::new("clone", ProviderKind::OpenAi).with_limits(256, 2_000);
        config.api_key = Some("sk-test".to_string());
        config.api_base = Some(server.uri());
        OpenAiAdapter::new(&config).unwrap()
    }

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7}
        })
    }

    #[tokio::test]
    async fn test_generate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("You wait. (Y/N)")))
            .expect(1)
            .mount(&server)
            .await;

        let content = adapter(&server)
            .generate(
                "Wait",
                &[Turn::narrator("Hi. (Y/N)")],
                64,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert_eq!(content.text, "You wait. (Y/N)");
        assert_eq!((content.tokens_in, content.tokens_out), (42, 7));
        assert!(!content.estimated);
        assert_eq!(content.raw_metadata["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "abcdefgh"}}]
            })))
            .mount(&server)
            .await;

        let content = adapter(&server)
            .generate("abcd", &[], 64, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(content.estimated);
        assert_eq!((content.tokens_in, content.tokens_out), (1, 2));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let cases = [
            (429, ErrorCategory::RateLimit),
            (401, ErrorCategory::Auth),
            (503, ErrorCategory::Network),
            (400, ErrorCategory::Rejected),
        ];
        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let err = adapter(&server)
                .generate("Go", &[], 64, Duration::from_secs(2))
                .await
                .unwrap_err();
            assert_eq!(err.category(), expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_retry_after_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .generate("Go", &[], 64, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::RateLimited {
                retry_after_secs: Some(12),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .generate("Go", &[], 64, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parse);
    }

    #[tokio::test]
    async fn test_empty_completion_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("")))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .generate("Go", &[], 64, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late (Y/N)"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = adapter(&server)
            .generate("Go", &[], 64, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::Timeout { after_ms: 50 });
    }

    #[tokio::test]
    async fn test_invalid_input_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("x (Y/N)")))
            .expect(0)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let empty = adapter.generate("", &[], 64, Duration::from_secs(1)).await;
        assert!(matches!(empty, Err(AdapterError::InvalidInput { .. })));
        let too_many = adapter.generate("Go", &[], 257, Duration::from_secs(1)).await;
        assert!(matches!(too_many, Err(AdapterError::InvalidInput { .. })));
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let mut config = ProviderConfig::new("clone", ProviderKind::OpenAi);
        config.api_key_env = Some("TALEGATE_TEST_UNSET_KEY_VAR".to_string());
        // Only meaningful when the conventional variable is also absent
        if std::env::var(API_KEY_ENV).is_err() {
            assert!(matches!(
                OpenAiAdapter::new(&config),
                Err(TaleError::Config(_))
            ));
        }
    }
}
