//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/talegate/config.toml)
//! 3. Project config (.talegate/config.toml)
//! 4. Environment variables (TALEGATE_* prefix, `__` separates nesting levels)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{Result, TaleError};

const APP_DIR: &str = "talegate";
const PROJECT_DIR: &str = ".talegate";
const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TALEGATE_";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain using Figment:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        Self::extract(Self::figment())
    }

    /// Load configuration from a specific file only (plus defaults)
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(TaleError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Toml::file(path)),
        )
    }

    /// The layered figment used by [`ConfigLoader::load`]
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // TALEGATE_ROUTER__MAX_HISTORY -> router.max_history
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Config> {
        let config: Config = figment
            .extract()
            .map_err(|e| TaleError::Config(format!("Configuration error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory (~/.config/talegate/)
    pub fn global_dir() -> Option<PathBuf> {
        env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join(".config"))
            })
            .map(|p| p.join(APP_DIR))
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join(CONFIG_FILE)
    }

    /// Get project data directory; relative ledger paths resolve against it
    pub fn project_dir() -> PathBuf {
        PathBuf::from(PROJECT_DIR)
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Show config file paths
    pub fn show_path() {
        println!("Configuration paths:");
        println!();

        if let Some(global) = Self::global_config_path() {
            let exists = if global.exists() { "✓" } else { "✗" };
            println!("  Global:  {} {}", exists, global.display());
        } else {
            println!("  Global:  (not available)");
        }

        let project = Self::project_config_path();
        let exists = if project.exists() { "✓" } else { "✗" };
        println!("  Project: {} {}", exists, project.display());
    }

    /// Show current effective configuration
    pub fn show_config(as_json: bool) -> Result<()> {
        let config = Self::load()?;
        println!("{}", Self::render(&config, as_json)?);
        Ok(())
    }

    /// Render configuration as pretty JSON or TOML. API keys are never included.
    pub fn render(config: &Config, as_json: bool) -> Result<String> {
        if as_json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            toml::to_string_pretty(config).map_err(|e| TaleError::Config(e.to_string()))
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Initialize global configuration
    pub fn init_global(force: bool) -> Result<PathBuf> {
        let global_dir = Self::global_dir().ok_or_else(|| {
            TaleError::Config("Cannot determine global config directory".to_string())
        })?;
        Self::write_template(&global_dir, Self::default_global_config(), force)
    }

    /// Initialize project configuration
    pub fn init_project(force: bool) -> Result<PathBuf> {
        Self::write_template(&Self::project_dir(), Self::default_project_config(), force)
    }

    fn write_template(dir: &Path, content: &str, force: bool) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() || force {
            fs::write(&config_path, content)?;
            info!("Created config: {}", config_path.display());
        } else {
            info!("Config exists: {}", config_path.display());
        }

        Ok(config_path)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Default global config content (TOML)
    fn default_global_config() -> &'static str {
        r#"# Talegate Global Configuration
# User-wide defaults. Project settings in .talegate/config.toml override these.

# Providers are tried in ascending priority; ties keep file order.
# API keys come from `api_key_env` or the provider's conventional variable.
#
# [[providers]]
# name = "primary"
# kind = "openai"
# model = "gpt-4o-mini"
# priority = 1
# api_key_env = "OPENAI_API_KEY"
# cost_per_input_token = "0.00000015"
# cost_per_output_token = "0.0000006"
#
# [[providers]]
# name = "local"
# kind = "ollama"
# model = "llama3.1"
# priority = 10

[router]
max_history = 50
timeout_grace_ms = 250
record_rejected_spend = true

[router.circuit_breaker]
failure_threshold = 5
failure_window_secs = 60
cooldown_secs = 30
"#
    }

    /// Default project config content (TOML)
    fn default_project_config() -> &'static str {
        r#"# Talegate Project Configuration
# Project-specific settings that override global defaults.

[quality]
min_length = 1
max_length = 4000
terminal_markers = ["(Y/N)", "(Restart?)"]
denylist = []
reject_emoji = true
mode = "fail_fast"

# Monthly global cap; requests are refused at 95% of the limit.
# [[budget.policies]]
# scope = { kind = "global" }
# limit_amount = "50.00"
# alert_fractions = ["0.6", "0.75", "0.85", "0.9"]

[ledger]
backend = "sqlite"
path = "ledger.db"
"#
    }
}
