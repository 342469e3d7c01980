//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//!
//! ## Layers
//!
//! - **AdapterError**: a single provider attempt failed (absorbed by the router)
//! - **LedgerError**: cost ledger persistence failed (budget checks fail closed)
//! - **TelemetryError**: a telemetry sink rejected an event (always swallowed)
//! - **TaleError**: the crate-wide error; only validation, budget, exhaustion
//!   and cancellation ever reach a router caller
//!
//! ## Design Principles
//!
//! - Structured error variants with context for better debugging
//! - Category-based routing for circuit breaker and fallback decisions
//! - No panic/unwrap - all errors are recoverable

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::ai::budget::DenialReason;
use crate::types::{GenerationAttempt, RequestId};

// =============================================================================
// Error Categories
// =============================================================================

/// Coarse error categories used for logging, metrics and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Rate limited - move to the next provider immediately
    RateLimit,
    /// Authentication failed - provider disabled until reload
    Auth,
    /// Network/connectivity or 5xx issues - transient
    Network,
    /// Provider exceeded its time budget
    Timeout,
    /// Provider answered with something unparseable
    Parse,
    /// Provider refused the request (4xx other than auth/rate limit)
    Rejected,
    /// Request never left the process
    InvalidInput,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Parse => write!(f, "PARSE"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::InvalidInput => write!(f, "INVALID_INPUT"),
        }
    }
}

// =============================================================================
// Adapter Error
// =============================================================================

/// Failure of one provider attempt.
///
/// Adapters never retry internally; the router decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Provider's retry-after hint; informational only
        retry_after_secs: Option<u64>,
    },

    #[error("authentication failed: {message}")]
    AuthFailure { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl AdapterError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_secs: retry_after.map(|d| d.as_secs()),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthFailure {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::AuthFailure { .. } => ErrorCategory::Auth,
            Self::Network { .. } => ErrorCategory::Network,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::MalformedResponse { .. } => ErrorCategory::Parse,
            Self::Rejected { .. } => ErrorCategory::Rejected,
            Self::InvalidInput { .. } => ErrorCategory::InvalidInput,
        }
    }

    /// Whether this failure counts against the provider's circuit breaker.
    ///
    /// Invalid input is a caller/configuration problem, not provider health.
    pub fn counts_as_provider_failure(&self) -> bool {
        !matches!(self, Self::InvalidInput { .. })
    }

    /// Whether the provider should be taken out of rotation until reload
    pub fn disables_provider(&self) -> bool {
        matches!(self, Self::AuthFailure { .. })
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps transport-level outcomes onto [`AdapterError`]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a non-success HTTP status
    pub fn classify_http_status(
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> AdapterError {
        let message = truncate_body(body);
        match status {
            429 => AdapterError::rate_limited(message, retry_after),
            401 | 403 => AdapterError::auth(message),
            500..=599 => AdapterError::network(format!("server error {status}: {message}")),
            _ => AdapterError::Rejected { status, message },
        }
    }

    /// Classify a reqwest transport error
    pub fn classify_transport(err: &reqwest::Error, timeout: Duration) -> AdapterError {
        if err.is_timeout() {
            AdapterError::timeout(timeout)
        } else if err.is_decode() {
            AdapterError::malformed(err.to_string())
        } else {
            AdapterError::network(err.to_string())
        }
    }

    /// Parse a `retry-after` header expressed in seconds
    pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
        value
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

fn truncate_body(body: &str) -> String {
    const MAX_BODY_CHARS: usize = 512;
    if body.chars().count() <= MAX_BODY_CHARS {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{truncated}...")
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Structured validation error with context
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// What validation failed
    pub kind: ValidationErrorKind,
    /// Field or component that failed validation
    pub field: Option<String>,
    /// Detailed message
    pub message: String,
    /// Expected value or format
    pub expected: Option<String>,
    /// Actual value received
    pub actual: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Validation failed for '{}': {}", field, self.message)?;
        } else {
            write!(f, "Validation failed: {}", self.message)?;
        }
        if let (Some(expected), Some(actual)) = (&self.expected, &self.actual) {
            write!(f, " (expected {expected}, got {actual})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_comparison(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field missing or empty
    MissingField,
    /// Value out of range
    Range,
}

// =============================================================================
// Ledger / Telemetry Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger record corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("telemetry channel full")]
    ChannelFull,

    #[error("telemetry channel closed")]
    ChannelClosed,

    #[error("telemetry sink failed: {0}")]
    Sink(String),
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum TaleError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // -------------------------------------------------------------------------
    // Router outcomes
    // -------------------------------------------------------------------------
    #[error("{0}")]
    Validation(ValidationError),

    #[error("Budget exceeded: {reason}")]
    BudgetExceeded { reason: DenialReason },

    #[error("All providers exhausted for request {request_id} after {} attempt(s)", .attempts.len())]
    ProvidersExhausted {
        request_id: RequestId,
        attempts: Vec<GenerationAttempt>,
    },

    #[error("Request {request_id} cancelled")]
    Cancelled {
        request_id: RequestId,
        attempts: Vec<GenerationAttempt>,
    },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<ValidationError> for TaleError {
    fn from(err: ValidationError) -> Self {
        TaleError::Validation(err)
    }
}

pub type Result<T> = std::result::Result<T, TaleError>;

impl TaleError {
    /// Short, provider-agnostic message suitable for an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Invalid request.",
            Self::BudgetExceeded { .. } => "Budget limit reached. Please try again later.",
            Self::ProvidersExhausted { .. } => "All storytellers are busy. Please try again.",
            Self::Cancelled { .. } => "Request cancelled.",
            _ => "Something went wrong.",
        }
    }

    /// Attempt log carried by terminal router errors, if any
    pub fn attempts(&self) -> &[GenerationAttempt] {
        match self {
            Self::ProvidersExhausted { attempts, .. } | Self::Cancelled { attempts, .. } => {
                attempts
            }
            _ => &[],
        }
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| TaleError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| TaleError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RATE_LIMIT");
        assert_eq!(ErrorCategory::Auth.to_string(), "AUTH");
        assert_eq!(ErrorCategory::InvalidInput.to_string(), "INVALID_INPUT");
    }

    #[test]
    fn test_classify_http_status() {
        let rate_limit =
            ErrorClassifier::classify_http_status(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(
            rate_limit,
            AdapterError::RateLimited {
                message: "slow down".to_string(),
                retry_after_secs: Some(7),
            }
        );

        let auth = ErrorClassifier::classify_http_status(401, "bad key", None);
        assert_eq!(auth.category(), ErrorCategory::Auth);
        assert!(auth.disables_provider());

        let server = ErrorClassifier::classify_http_status(503, "overloaded", None);
        assert_eq!(server.category(), ErrorCategory::Network);

        let rejected = ErrorClassifier::classify_http_status(422, "bad body", None);
        assert_eq!(rejected.category(), ErrorCategory::Rejected);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            ErrorClassifier::parse_retry_after(Some(" 30 ")),
            Some(Duration::from_secs(30))
        );
        assert_eq!(ErrorClassifier::parse_retry_after(Some("soon")), None);
        assert_eq!(ErrorClassifier::parse_retry_after(None), None);
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let err = ErrorClassifier::classify_http_status(400, &body, None);
        match err {
            AdapterError::Rejected { message, .. } => {
                assert!(message.len() < 600);
                assert!(message.ends_with("..."));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(AdapterError::network("reset").counts_as_provider_failure());
        assert!(AdapterError::timeout(Duration::from_secs(1)).counts_as_provider_failure());
        assert!(!AdapterError::invalid_input("empty prompt").counts_as_provider_failure());
    }

    #[test]
    fn test_adapter_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(AdapterError::timeout(Duration::from_millis(1500))).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["after_ms"], 1500);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new(ValidationErrorKind::Range, "history too long")
            .with_field("context_history")
            .with_comparison("<= 4", "5");
        assert_eq!(
            err.to_string(),
            "Validation failed for 'context_history': history too long (expected <= 4, got 5)"
        );
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let validation = TaleError::Validation(ValidationError::new(
            ValidationErrorKind::MissingField,
            "prompt is empty",
        ));
        let exhausted = TaleError::ProvidersExhausted {
            request_id: RequestId::new("r-1"),
            attempts: Vec::new(),
        };
        let budget = TaleError::BudgetExceeded {
            reason: DenialReason::LedgerUnavailable {
                message: "down".to_string(),
            },
        };
        assert_ne!(validation.user_message(), exhausted.user_message());
        assert_ne!(exhausted.user_message(), budget.user_message());
        assert_ne!(validation.user_message(), budget.user_message());
    }
}
