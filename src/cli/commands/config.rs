//! Config Command
//!
//! Manage Talegate configuration.
//!
//! Usage:
//!   talegate config show [-f json|toml]
//!   talegate config path
//!   talegate config init [-g] [--force]

use crate::config::ConfigLoader;
use crate::types::{Result, TaleError};

/// Show merged effective configuration
pub fn show(format: &str) -> Result<()> {
    match format {
        "json" => ConfigLoader::show_config(true),
        "toml" => ConfigLoader::show_config(false),
        other => Err(TaleError::Config(format!(
            "Unknown format '{}'. Valid values: json, toml",
            other
        ))),
    }
}

/// Show configuration paths
pub fn path() -> Result<()> {
    ConfigLoader::show_path();
    Ok(())
}

/// Initialize global or project configuration
pub fn init(global: bool, force: bool) -> Result<()> {
    let (scope, path) = if global {
        ("global", ConfigLoader::init_global(force)?)
    } else {
        ("project", ConfigLoader::init_project(force)?)
    };
    println!("✓ Initialized {} configuration", scope);
    println!("  Config: {}", path.display());
    Ok(())
}
