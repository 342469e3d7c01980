//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/talegate/) and project (.talegate/) level configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::ai::budget::{BudgetPolicy, PolicySet};
use crate::ai::provider::ProviderConfig;
use crate::ai::quality::ScoringMode;
use crate::constants;
use crate::types::{Result, TaleError};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Providers in configuration order; `priority` decides the try order
    pub providers: Vec<ProviderConfig>,

    /// Failover and circuit breaker settings
    pub router: RouterConfig,

    /// Quality scoring constraints
    pub quality: QualityConfig,

    /// Spending limits
    pub budget: BudgetConfig,

    /// Cost ledger persistence
    pub ledger: LedgerConfig,
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `TaleError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(TaleError::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }

        if self.router.max_history == 0 {
            return Err(TaleError::Config(
                "router.max_history must be greater than 0".to_string(),
            ));
        }

        let breaker = &self.router.circuit_breaker;
        if breaker.failure_threshold == 0
            || breaker.half_open_max_requests == 0
            || breaker.success_threshold == 0
        {
            return Err(TaleError::Config(
                "router.circuit_breaker thresholds must be greater than 0".to_string(),
            ));
        }

        if self.quality.min_length > self.quality.max_length {
            return Err(TaleError::Config(format!(
                "quality.min_length ({}) exceeds quality.max_length ({})",
                self.quality.min_length, self.quality.max_length
            )));
        }

        PolicySet::new(self.budget.policies.clone())?;
        Ok(())
    }

    /// Look up a provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

// =============================================================================
// Router Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum prior turns accepted per request
    pub max_history: usize,

    /// Grace added to each provider timeout before the router gives up
    pub timeout_grace_ms: u64,

    /// Bill responses that were received but failed quality scoring
    pub record_rejected_spend: bool,

    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_history: constants::router::MAX_HISTORY,
            timeout_grace_ms: constants::router::TIMEOUT_GRACE_MS,
            record_rejected_spend: constants::router::RECORD_REJECTED_SPEND,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Per-provider circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub cooldown_secs: u64,
    pub half_open_max_requests: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: constants::circuit_breaker::FAILURE_THRESHOLD,
            failure_window_secs: constants::circuit_breaker::FAILURE_WINDOW_SECS,
            cooldown_secs: constants::circuit_breaker::COOLDOWN_SECS,
            half_open_max_requests: constants::circuit_breaker::HALF_OPEN_MAX_REQUESTS,
            success_threshold: constants::circuit_breaker::SUCCESS_THRESHOLD,
        }
    }
}

// =============================================================================
// Quality Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum trimmed length in characters
    pub min_length: usize,

    /// Maximum trimmed length in characters
    pub max_length: usize,

    /// Accepted endings for a story beat
    pub terminal_markers: Vec<String>,

    /// Regex patterns for disallowed content
    pub denylist: Vec<String>,

    pub reject_emoji: bool,

    pub mode: ScoringMode,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_length: constants::quality::MIN_LENGTH,
            max_length: constants::quality::MAX_LENGTH,
            terminal_markers: constants::quality::TERMINAL_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            denylist: Vec::new(),
            reject_emoji: true,
            mode: ScoringMode::FailFast,
        }
    }
}

// =============================================================================
// Budget Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub policies: Vec<BudgetPolicy>,
}

// =============================================================================
// Ledger Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// SQLite file shared across processes
    Sqlite,
}

impl std::fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerBackend::Memory => write!(f, "memory"),
            LedgerBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,

    /// SQLite file; relative paths resolve against the project directory
    pub path: Option<PathBuf>,
}
