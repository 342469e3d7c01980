//! SQLite Cost Ledger with Connection Pooling
//!
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Version-tracked migrations
//! - WAL mode so sums never block appends
//!
//! Amounts are stored as decimal text and summed in Rust, so totals are exact.
//! All pool access runs on the blocking thread pool.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use rust_decimal::Decimal;
use std::time::Duration;

use super::ledger::{CostLedger, CostRecord, window_start};
use crate::ai::budget::BudgetScope;
use crate::types::{LedgerError, Result, ResultExt, TaleError};

/// Current schema version for migration tracking
const SCHEMA_VERSION: u32 = 2;

struct Migration {
    version: u32,
    description: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create cost_records table",
        up: "CREATE TABLE IF NOT EXISTS cost_records (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp_ms  INTEGER NOT NULL,
                 provider_name TEXT    NOT NULL,
                 user_id       TEXT    NOT NULL,
                 tokens_in     INTEGER NOT NULL,
                 tokens_out    INTEGER NOT NULL,
                 cost_amount   TEXT    NOT NULL
             )",
    },
    Migration {
        version: 2,
        description: "Index windowed sums by scope",
        up: "CREATE INDEX IF NOT EXISTS idx_cost_records_time
                 ON cost_records(timestamp_ms);
             CREATE INDEX IF NOT EXISTS idx_cost_records_user_time
                 ON cost_records(user_id, timestamp_ms);
             CREATE INDEX IF NOT EXISTS idx_cost_records_provider_time
                 ON cost_records(provider_name, timestamp_ms)",
    },
];

/// Connection pool configuration
///
/// Pool size is dynamically calculated based on CPU cores.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 2;
    const MAX_POOL_SIZE: u32 = 16;

    /// clamp(cores * 2, MIN, MAX)
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        (cores * 2).clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(1),
            connection_timeout_secs: 5,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Durable ledger backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)
            .map_err(|e| TaleError::Storage(format!("Failed to create connection pool: {}", e)))?;

        let ledger = Self { pool };
        ledger.migrate()?;
        Ok(ledger)
    }

    /// Single-connection in-memory ledger for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| TaleError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        let ledger = Self { pool };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            TaleError::Storage(format!("Failed to acquire ledger connection: {}", e))
        })
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.conn()?
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .with_context("Failed to read schema version")
    }

    /// Apply each pending migration together with its version bump
    fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version()?;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }
            self.transaction(|tx| {
                tx.execute_batch(migration.up).with_context_fn(|| {
                    format!(
                        "Failed to apply migration {}: {}",
                        migration.version, migration.description
                    )
                })?;
                tx.pragma_update(None, "user_version", migration.version)
                    .with_context("Failed to update schema version")
            })?;

            tracing::info!(
                "Applied ledger migration {}: {}",
                migration.version,
                migration.description
            );
        }

        tracing::debug!(version = SCHEMA_VERSION, "Ledger schema up to date");
        Ok(())
    }

    /// Execute a function within a panic-safe transaction.
    ///
    /// If the closure errors or panics, the transaction is rolled back and the
    /// pooled connection stays usable.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            // Rolled back on drop
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(TaleError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    /// Run `f` with a pooled connection on the blocking thread pool
    async fn blocking<F, T>(&self, f: F) -> std::result::Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| {
                LedgerError::Unavailable(format!("Failed to acquire ledger connection: {e}"))
            })?;
            f(&*conn)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(format!("Ledger task failed: {e}")))?
    }

    /// Delete records older than `cutoff`, returning how many were removed.
    /// Retention is the operator's call; nothing in the router prunes.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> std::result::Result<usize, LedgerError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM cost_records WHERE timestamp_ms < ?1",
                params![cutoff_ms],
            )
            .map_err(unavailable("prune cost records"))
        })
        .await
    }

    pub async fn count(&self) -> std::result::Result<u64, LedgerError> {
        self.blocking(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cost_records", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
            .map_err(unavailable("count cost records"))
        })
        .await
    }
}

fn unavailable(action: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |e| LedgerError::Unavailable(format!("Failed to {action}: {e}"))
}

/// SQL filter and bound value for a scope
fn scope_clause(scope: &BudgetScope) -> (&'static str, Option<String>) {
    match scope {
        BudgetScope::Global => ("", None),
        BudgetScope::PerUser { user_id } => (" AND user_id = ?3", Some(user_id.to_string())),
        BudgetScope::PerProvider { provider } => {
            (" AND provider_name = ?3", Some(provider.clone()))
        }
    }
}

#[async_trait]
impl CostLedger for SqliteLedger {
    async fn record(&self, record: CostRecord) -> std::result::Result<(), LedgerError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO cost_records
                 (timestamp_ms, provider_name, user_id, tokens_in, tokens_out, cost_amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.timestamp().timestamp_millis(),
                    record.provider_name(),
                    record.user_id().as_str(),
                    i64::from(record.tokens_in()),
                    i64::from(record.tokens_out()),
                    record.cost_amount().to_string(),
                ],
            )
            .map(|_| ())
            .map_err(unavailable("insert cost record"))
        })
        .await
    }

    async fn windowed_sum_at(
        &self,
        scope: &BudgetScope,
        window: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<Decimal, LedgerError> {
        let start_ms = window_start(now, window).timestamp_millis();
        let end_ms = now.timestamp_millis();
        let (filter, value) = scope_clause(scope);
        let sql = format!(
            "SELECT cost_amount FROM cost_records
             WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2{filter}"
        );

        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(unavailable("prepare windowed sum"))?;

            let amounts: Vec<String> = match &value {
                Some(v) => stmt
                    .query_map(params![start_ms, end_ms, v], |row| row.get(0))
                    .and_then(|rows| rows.collect::<std::result::Result<Vec<String>, _>>()),
                None => stmt
                    .query_map(params![start_ms, end_ms], |row| row.get(0))
                    .and_then(|rows| rows.collect::<std::result::Result<Vec<String>, _>>()),
            }
            .map_err(unavailable("read cost records"))?;

            amounts.iter().try_fold(Decimal::ZERO, |sum, text| {
                Decimal::from_str(text)
                    .map(|amount| sum + amount)
                    .map_err(|e| LedgerError::Corrupt(format!("cost_amount '{text}': {e}")))
            })
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{ProviderConfig, ProviderKind};
    use crate::types::UserId;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig::new(name, ProviderKind::OpenAi)
            .with_rates(Decimal::new(3, 6), Decimal::new(15, 6))
    }

    fn record(provider_name: &str, user: &str, tokens_in: u32) -> CostRecord {
        CostRecord::new(&provider(provider_name), UserId::from(user), tokens_in, 100)
    }

    #[test]
    fn test_migrations_reach_current_version() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(ledger.schema_version().unwrap(), SCHEMA_VERSION);

        let conn = ledger.conn().unwrap();
        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='cost_records'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(indexes.contains(&"idx_cost_records_user_time".to_string()));
        assert!(indexes.contains(&"idx_cost_records_provider_time".to_string()));
    }

    #[tokio::test]
    async fn test_records_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");

        let expected = {
            let ledger = SqliteLedger::open(&path).unwrap();
            let a = record("openai", "alice", 1_000);
            let b = record("anthropic", "bob", 2_000);
            let expected = a.cost_amount() + b.cost_amount();
            ledger.record(a).await.unwrap();
            ledger.record(b).await.unwrap();
            expected
        };

        let reopened = SqliteLedger::open(&path).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        assert_eq!(
            reopened.windowed_sum(&BudgetScope::Global, DAY).await.unwrap(),
            expected
        );
        assert_eq!(reopened.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_scoped_sums() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let alice_openai = record("openai", "alice", 1_000);
        let alice_local = record("local", "alice", 500);
        let bob_openai = record("openai", "bob", 3_000);
        let (a, b, c) = (
            alice_openai.cost_amount(),
            alice_local.cost_amount(),
            bob_openai.cost_amount(),
        );
        for r in [alice_openai, alice_local, bob_openai] {
            ledger.record(r).await.unwrap();
        }

        let user = BudgetScope::PerUser {
            user_id: "alice".into(),
        };
        let provider = BudgetScope::PerProvider {
            provider: "openai".to_string(),
        };
        assert_eq!(ledger.windowed_sum(&user, DAY).await.unwrap(), a + b);
        assert_eq!(ledger.windowed_sum(&provider, DAY).await.unwrap(), a + c);
    }

    #[tokio::test]
    async fn test_window_excludes_old_and_future_records() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let now = Utc::now();
        let recent = record("p", "u", 1_000).at(now - TimeDelta::hours(2));
        let expected = recent.cost_amount();
        ledger
            .record(record("p", "u", 9_000).at(now - TimeDelta::days(3)))
            .await
            .unwrap();
        ledger.record(recent).await.unwrap();
        ledger
            .record(record("p", "u", 7_000).at(now + TimeDelta::hours(1)))
            .await
            .unwrap();

        let sum = ledger
            .windowed_sum_at(&BudgetScope::Global, DAY, now)
            .await
            .unwrap();
        assert_eq!(sum, expected);
    }

    #[tokio::test]
    async fn test_corrupt_amount_is_reported() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO cost_records
                 (timestamp_ms, provider_name, user_id, tokens_in, tokens_out, cost_amount)
                 VALUES (?1, 'p', 'u', 1, 1, 'twelve')",
                params![Utc::now().timestamp_millis()],
            )
            .unwrap();

        let err = ledger
            .windowed_sum(&BudgetScope::Global, DAY)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_prune_before_removes_old_records() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let now = Utc::now();
        ledger
            .record(record("p", "u", 1).at(now - TimeDelta::days(40)))
            .await
            .unwrap();
        ledger.record(record("p", "u", 1)).await.unwrap();

        let removed = ledger
            .prune_before(now - TimeDelta::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_all_counted() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open(dir.path().join("ledger.db")).unwrap());

        let records: Vec<CostRecord> = (0..40)
            .map(|i| record(&format!("p{}", i % 3), &format!("u{}", i % 5), i * 37))
            .collect();
        let expected: Decimal = records.iter().map(CostRecord::cost_amount).sum();

        let handles: Vec<_> = records
            .into_iter()
            .map(|r| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.record(r).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.count().await.unwrap(), 40);
        let sum = ledger
            .windowed_sum_at(
                &BudgetScope::Global,
                DAY,
                Utc::now() + TimeDelta::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_transaction_panic_safety() {
        let ledger = SqliteLedger::open_in_memory().unwrap();

        let result: Result<()> = ledger.transaction(|_conn| {
            panic!("Intentional panic for testing");
        });

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("panicked"));

        // Pool is still usable
        assert_eq!(ledger.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let ledger = SqliteLedger::open_in_memory().unwrap();

        let result: Result<()> = ledger.transaction(|conn| {
            conn.execute(
                "INSERT INTO cost_records
                 (timestamp_ms, provider_name, user_id, tokens_in, tokens_out, cost_amount)
                 VALUES (0, 'p', 'u', 1, 1, '1')",
                [],
            )
            .with_context("insert")?;
            Err(TaleError::Storage("abort".to_string()))
        });
        assert!(result.is_err());

        let rows: i64 = ledger
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM cost_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }
}
