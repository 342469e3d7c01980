//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::{
    FanoutEmitter, ProviderRouter, SharedEmitter, SharedMetrics, TracingEmitter,
    create_shared_metrics,
};
use crate::config::{Config, ConfigLoader};
use crate::storage::{SharedLedger, create_ledger};
use crate::types::Result;

/// Command execution context
///
/// Loaded configuration plus the ledger and telemetry sinks every
/// command shares. Created via `CommandContext::load()`.
#[derive(Clone)]
pub struct CommandContext {
    /// Project data directory (.talegate)
    pub project_dir: PathBuf,
    /// Loaded configuration
    pub config: Config,
    pub ledger: SharedLedger,
    /// Counters for this invocation, fed from telemetry
    pub metrics: SharedMetrics,
}

impl CommandContext {
    /// Load configuration and open the configured ledger
    pub fn load() -> Result<Self> {
        let config = ConfigLoader::load()?;
        Self::from_config(config, ConfigLoader::project_dir())
    }

    pub fn from_config(config: Config, project_dir: PathBuf) -> Result<Self> {
        let ledger = create_ledger(&config.ledger, &project_dir)?;
        let metrics = create_shared_metrics(uuid::Uuid::new_v4().to_string());

        Ok(Self {
            project_dir,
            config,
            ledger,
            metrics,
        })
    }

    /// Telemetry goes to the tracing log and the metrics collector
    pub fn emitter(&self) -> SharedEmitter {
        let log: SharedEmitter = Arc::new(TracingEmitter);
        let metrics: SharedEmitter = self.metrics.clone();
        Arc::new(FanoutEmitter::new(vec![log, metrics]))
    }

    /// Router over the configured providers
    pub fn router(&self) -> Result<ProviderRouter> {
        ProviderRouter::from_config(&self.config, self.ledger.clone(), self.emitter())
    }
}
