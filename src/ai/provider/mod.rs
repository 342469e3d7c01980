//! AI Provider Abstraction
//!
//! Defines the [`ProviderAdapter`] trait every external text-generation
//! service implements. Adapters are stateless, never retry, and report every
//! failure as an [`AdapterError`] so the router can decide what to do next.
//!
//! ## Modules
//!
//! - `circuit_breaker`: per-provider health tracking used by the router
//! - `openai` / `anthropic` / `ollama`: HTTP adapters
//! - `prompt_utils`: story history to chat message mapping

mod anthropic;
mod circuit_breaker;
mod ollama;
mod openai;
mod prompt_utils;

pub use anthropic::AnthropicAdapter;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use prompt_utils::{ChatMessage, NARRATOR_SYSTEM_PROMPT, build_chat_messages, with_system};

// Re-export error types from centralized location
pub use crate::types::{AdapterError, ErrorCategory, ErrorClassifier};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::ai::tokenizer;
use crate::constants::{network as net_constants, provider as provider_constants};
use crate::types::{Result, TaleError, Turn};

// =============================================================================
// Generated Content
// =============================================================================

/// Text returned by a provider plus its token accounting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedContent {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Token counts were approximated locally because the provider omitted them
    pub estimated: bool,
    /// Provider-specific response details (model, finish reason, ids)
    pub raw_metadata: Value,
}

impl GeneratedContent {
    /// Content with provider-reported token counts
    pub fn new(text: impl Into<String>, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            text: text.into(),
            tokens_in,
            tokens_out,
            estimated: false,
            raw_metadata: Value::Null,
        }
    }

    /// Build content from a parsed provider response.
    ///
    /// Empty text is a malformed response. Missing usage counts are replaced
    /// with the character-based estimate and flagged as estimated.
    pub fn from_response(
        text: String,
        tokens_in: Option<u32>,
        tokens_out: Option<u32>,
        prompt: &str,
        history: &[Turn],
    ) -> std::result::Result<Self, AdapterError> {
        if text.is_empty() {
            return Err(AdapterError::malformed("provider returned empty text"));
        }

        let estimated = tokens_in.is_none() || tokens_out.is_none();
        let tokens_in =
            tokens_in.unwrap_or_else(|| tokenizer::estimate_request_tokens(prompt, history));
        let tokens_out = tokens_out.unwrap_or_else(|| tokenizer::estimate_tokens(&text));

        Ok(Self {
            text,
            tokens_in,
            tokens_out,
            estimated,
            raw_metadata: Value::Null,
        })
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.raw_metadata = metadata;
        self
    }
}

// =============================================================================
// Provider Configuration
// =============================================================================

/// Wire protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions
    #[default]
    OpenAi,
    /// Anthropic-compatible messages API
    Anthropic,
    /// Local Ollama chat
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// Configuration for one provider
///
/// Note: API keys are never serialized to output and are redacted in debug
/// output. Each adapter converts the key to `SecretString` internally.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name used in logs, ledger records and policies
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Lower values are tried first; ties keep configuration order
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Never serialized to output for security
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable to read the API key from when `api_key` is unset
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub cost_per_input_token: Decimal,
    #[serde(default)]
    pub cost_per_output_token: Decimal,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("cost_per_input_token", &self.cost_per_input_token)
            .field("cost_per_output_token", &self.cost_per_output_token)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_ms", &self.timeout_ms)
            .field("temperature", &self.temperature)
            .finish()
    }
}

fn default_max_tokens() -> u32 {
    provider_constants::DEFAULT_MAX_TOKENS
}

fn default_timeout_ms() -> u64 {
    provider_constants::DEFAULT_TIMEOUT_MS
}

fn default_temperature() -> f32 {
    provider_constants::DEFAULT_TEMPERATURE
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: 0,
            model: None,
            api_base: None,
            api_key: None,
            api_key_env: None,
            cost_per_input_token: Decimal::ZERO,
            cost_per_output_token: Decimal::ZERO,
            max_tokens: default_max_tokens(),
            timeout_ms: default_timeout_ms(),
            temperature: default_temperature(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rates(mut self, input: Decimal, output: Decimal) -> Self {
        self.cost_per_input_token = input;
        self.cost_per_output_token = output;
        self
    }

    pub fn with_limits(mut self, max_tokens: u32, timeout_ms: u64) -> Self {
        self.max_tokens = max_tokens;
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Exact cost of a call with the given token counts at this provider's rates
    pub fn cost_for(&self, tokens_in: u32, tokens_out: u32) -> Decimal {
        self.cost_per_input_token * Decimal::from(tokens_in)
            + self.cost_per_output_token * Decimal::from(tokens_out)
    }

    /// API key from config, then `api_key_env`, then the kind's conventional variable
    pub fn resolve_api_key(&self, default_env: &str) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .or_else(|| std::env::var(default_env).ok())
            .filter(|key| !key.trim().is_empty())
    }

    /// Validate values are within acceptable ranges.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TaleError::Config("provider name must not be empty".to_string()));
        }
        if self.cost_per_input_token.is_sign_negative()
            || self.cost_per_output_token.is_sign_negative()
        {
            return Err(TaleError::Config(format!(
                "provider '{}': token rates must be non-negative",
                self.name
            )));
        }
        if self.max_tokens == 0 {
            return Err(TaleError::Config(format!(
                "provider '{}': max_tokens must be greater than 0",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(TaleError::Config(format!(
                "provider '{}': timeout_ms must be greater than 0",
                self.name
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(TaleError::Config(format!(
                "provider '{}': temperature must be between 0.0 and 2.0, got {}",
                self.name, self.temperature
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Provider Adapter Trait
// =============================================================================

/// One external AI text-generation service
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Generate the next story beat.
    ///
    /// `prompt` must be non-empty and `max_tokens` must not exceed
    /// [`max_tokens_ceiling`](Self::max_tokens_ceiling); violations return
    /// `InvalidInput` without a network call. The adapter enforces `timeout`
    /// itself and reports expiry as `AdapterError::Timeout`.
    async fn generate(
        &self,
        prompt: &str,
        context_history: &[Turn],
        max_tokens: u32,
        timeout: Duration,
    ) -> std::result::Result<GeneratedContent, AdapterError>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model name currently in use
    fn model(&self) -> &str;

    /// Largest `max_tokens` this adapter accepts
    fn max_tokens_ceiling(&self) -> u32;
}

/// Shared adapter type for concurrent access across requests.
pub type SharedAdapter = Arc<dyn ProviderAdapter>;

/// Reject inputs that must never reach the network
pub fn check_input(
    prompt: &str,
    max_tokens: u32,
    ceiling: u32,
) -> std::result::Result<(), AdapterError> {
    if prompt.trim().is_empty() {
        return Err(AdapterError::invalid_input("prompt must not be empty"));
    }
    if max_tokens == 0 || max_tokens > ceiling {
        return Err(AdapterError::invalid_input(format!(
            "max_tokens {max_tokens} outside 1..={ceiling}"
        )));
    }
    Ok(())
}

/// Create a shared adapter from configuration
pub fn create_adapter(config: &ProviderConfig) -> Result<SharedAdapter> {
    config.validate()?;
    match config.kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiAdapter::new(config)?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicAdapter::new(config)?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaAdapter::new(config)?)),
    }
}

/// HTTP client shared by the adapters' constructors
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(net_constants::CONNECTION_TIMEOUT_SECS))
        .build()
        .map_err(|e| TaleError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Validate endpoint URL for security (SSRF prevention)
///
/// Only allows http/https schemes. Trailing slashes are stripped so paths
/// can be appended directly.
pub(crate) fn validate_endpoint(endpoint: &str, provider: &str) -> Result<String> {
    let url = url::Url::parse(endpoint).map_err(|e| {
        TaleError::Config(format!(
            "Invalid endpoint URL '{}' for provider '{}': {}",
            endpoint, provider, e
        ))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(TaleError::Config(format!(
            "Provider '{}' endpoint must use http or https scheme, got: {}",
            provider,
            url.scheme()
        )));
    }

    if url.scheme() == "http"
        && let Some(host) = url.host_str()
        && !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
    {
        warn!(
            provider,
            "Endpoint uses plain http on a non-local host: {}. Ensure this is intentional.", host
        );
    }

    Ok(endpoint.trim_end_matches('/').to_string())
}
