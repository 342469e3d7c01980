//! Talegate - Budget-Aware Narrative Generation Router
//!
//! Routes interactive-fiction generation requests across several AI
//! providers, scores every response for quality, and keeps spend inside
//! configured budgets.
//!
//! ## Core Features
//!
//! - **Sequential Failover**: providers are tried in priority order until one
//!   returns a response that passes quality scoring
//! - **Budget Governance**: rolling-window limits per user, per provider and
//!   globally, with advisory alerts and a fail-closed hard stop
//! - **Cost Ledger**: exact decimal accounting in memory or SQLite
//! - **Circuit Breakers**: unhealthy providers are skipped until they recover
//! - **Telemetry**: structured events for every attempt and decision
//!
//! ## Quick Start
//!
//! ```ignore
//! use talegate::{ConfigLoader, GenerationRequest, ProviderRouter, TracingEmitter};
//! use talegate::storage::create_ledger;
//!
//! let config = ConfigLoader::load()?;
//! let ledger = create_ledger(&config.ledger, &ConfigLoader::project_dir())?;
//! let router = ProviderRouter::from_config(&config, ledger, Arc::new(TracingEmitter))?;
//!
//! let request = GenerationRequest::new("reader-7", "Open the door");
//! let result = router.generate_narrative(&request).await?;
//! println!("{}", result.content.text);
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: provider adapters, router, quality scoring, budget governor, telemetry
//! - [`storage`]: cost ledger backends
//! - [`config`]: layered configuration
//! - [`types`]: requests, attempts and the error taxonomy

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod storage;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{AdapterError, ErrorCategory, LedgerError, Result, ResultExt, TaleError};

// Request/Response Types
pub use types::{GenerationAttempt, GenerationRequest, GenerationResult, RequestId, Turn, UserId};

// Storage
pub use storage::{CostLedger, CostRecord, MemoryLedger, SharedLedger, SqliteLedger};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    // Budget
    BudgetGovernor,
    BudgetPolicy,
    BudgetScope,
    // Metrics
    MetricsCollector,
    // Providers
    ProviderAdapter,
    ProviderConfig,
    ProviderKind,
    // Routing
    ProviderRouter,
    QualityScorer,
    SharedMetrics,
    // Telemetry
    TelemetryEmitter,
    TelemetryEvent,
    TracingEmitter,
};
