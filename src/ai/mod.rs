//! AI Integration Layer
//!
//! Provider adapters, routing with failover, quality scoring, budget
//! governance and telemetry for narrative generation.

pub mod budget;
pub mod metrics;
pub mod provider;
pub mod quality;
pub mod router;
pub mod telemetry;
pub mod timeout;
pub mod tokenizer;

pub use budget::{
    BudgetGovernor, BudgetPolicy, BudgetScope, Clearance, DenialReason, PolicySet, PolicyStatus,
};
pub use metrics::{
    MetricsCollector, MetricsSummary, ProviderShare, SharedMetrics, create_shared_metrics,
};
pub use provider::{
    AnthropicAdapter, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    GeneratedContent, OllamaAdapter, OpenAiAdapter, ProviderAdapter, ProviderConfig, ProviderKind,
    SharedAdapter, create_adapter,
};
pub use quality::{IssueTag, QualityConstraints, QualityScore, QualityScorer, ScoringMode};
pub use router::{ProviderEntry, ProviderRouter, ProviderRouterBuilder};
pub use telemetry::{
    ChannelEmitter, FanoutEmitter, NullEmitter, SharedEmitter, TelemetryEmitter, TelemetryEvent,
    TracingEmitter, emit_quietly,
};
pub use timeout::{guard_timeout, with_timeout};
pub use tokenizer::{TokenCounter, TokenEstimator, estimate_request_tokens, estimate_tokens};
