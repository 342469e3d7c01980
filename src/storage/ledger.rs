//! Cost Ledger
//!
//! Append-only record of money spent on provider calls, with windowed sums
//! for budget enforcement. Amounts are `Decimal`, so sums are exact.
//!
//! Visibility is monotonic: once `record` returns, every sum that starts
//! afterwards includes the record.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::ai::budget::BudgetScope;
use crate::ai::provider::ProviderConfig;
use crate::types::{LedgerError, UserId};

// =============================================================================
// Cost Record
// =============================================================================

/// One ledger entry. `cost_amount` is derived from the token counts and the
/// provider's rates at construction and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostRecord {
    timestamp: DateTime<Utc>,
    provider_name: String,
    user_id: UserId,
    tokens_in: u32,
    tokens_out: u32,
    cost_amount: Decimal,
}

impl CostRecord {
    pub fn new(provider: &ProviderConfig, user_id: UserId, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            provider_name: provider.name.clone(),
            user_id,
            tokens_in,
            tokens_out,
            cost_amount: provider.cost_for(tokens_in, tokens_out),
        }
    }

    /// Override the timestamp (backfills and tests); the amount is unaffected
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn tokens_in(&self) -> u32 {
        self.tokens_in
    }

    pub fn tokens_out(&self) -> u32 {
        self.tokens_out
    }

    pub fn cost_amount(&self) -> Decimal {
        self.cost_amount
    }
}

/// Inclusive lower bound of a window ending at `now`
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// =============================================================================
// Ledger Trait
// =============================================================================

#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Append a record. Safe under concurrent calls.
    async fn record(&self, record: CostRecord) -> Result<(), LedgerError>;

    /// Sum of `cost_amount` for records in `scope` with timestamp in
    /// `[now - window, now]`
    async fn windowed_sum_at(
        &self,
        scope: &BudgetScope,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError>;

    async fn windowed_sum(
        &self,
        scope: &BudgetScope,
        window: Duration,
    ) -> Result<Decimal, LedgerError> {
        self.windowed_sum_at(scope, window, Utc::now()).await
    }

    /// Backend name for logs and the CLI
    fn backend(&self) -> &'static str;
}

pub type SharedLedger = Arc<dyn CostLedger>;

// =============================================================================
// In-Memory Ledger
// =============================================================================

/// Process-local ledger. Records are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<Vec<CostRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every record in insertion order
    pub fn records(&self) -> Vec<CostRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CostLedger for MemoryLedger {
    async fn record(&self, record: CostRecord) -> Result<(), LedgerError> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
        Ok(())
    }

    async fn windowed_sum_at(
        &self,
        scope: &BudgetScope,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let start = window_start(now, window);
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= now && scope.matches(r))
            .map(|r| r.cost_amount)
            .sum())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Test Support
// =============================================================================
