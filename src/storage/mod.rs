pub mod database;
pub mod ledger;

use std::path::Path;
use std::sync::Arc;

pub use database::{PoolConfig, SqliteLedger};
pub use ledger::{CostLedger, CostRecord, MemoryLedger, SharedLedger, window_start};

use crate::config::{LedgerBackend, LedgerConfig};
use crate::constants::storage as storage_constants;
use crate::types::{Result, ResultExt};

/// Open the configured ledger backend.
///
/// A relative SQLite path is resolved against `base_dir`; missing parent
/// directories are created.
pub fn create_ledger(config: &LedgerConfig, base_dir: &Path) -> Result<SharedLedger> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new())),
        LedgerBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| storage_constants::DEFAULT_LEDGER_FILE.into());
            let path = if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            };

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context_fn(|| {
                    format!("Failed to create ledger directory {}", parent.display())
                })?;
            }

            tracing::debug!(path = %path.display(), "Opening SQLite ledger");
            Ok(Arc::new(SqliteLedger::open(&path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_memory_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = create_ledger(&LedgerConfig::default(), dir.path()).unwrap();
        assert_eq!(ledger.backend(), "memory");
    }

    #[test]
    fn test_create_sqlite_ledger_resolves_relative_path() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            backend: LedgerBackend::Sqlite,
            path: Some("state/spend.db".into()),
        };

        let ledger = create_ledger(&config, dir.path()).unwrap();
        assert_eq!(ledger.backend(), "sqlite");
        assert!(dir.path().join("state/spend.db").exists());
    }
}
