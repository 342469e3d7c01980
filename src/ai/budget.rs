//! Budget Governance
//!
//! Pre-flight clearance and post-attempt accounting against rolling-window
//! spending limits.
//!
//! - [`BudgetGovernor::authorize`] checks Global and PerUser policies before
//!   any provider is contacted.
//! - [`BudgetGovernor::authorize_provider`] checks PerProvider policies right
//!   before a specific provider is called.
//! - [`BudgetGovernor::record_actual`] writes the true cost and raises
//!   advisory alerts.
//!
//! The governor fails closed: if the ledger cannot be read, requests are
//! denied. Enforcement is best effort under concurrency, so concurrent
//! requests near a limit can overshoot it by at most their own cost.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ai::telemetry::{SharedEmitter, TelemetryEvent, emit_quietly};
use crate::constants::budget as budget_constants;
use crate::storage::{CostRecord, SharedLedger};
use crate::types::{LedgerError, Result, TaleError, UserId};

// =============================================================================
// Scope and Policy
// =============================================================================

/// Which ledger records a policy aggregates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetScope {
    Global,
    PerUser { user_id: UserId },
    PerProvider { provider: String },
}

impl BudgetScope {
    /// Whether a record counts toward this scope
    pub fn matches(&self, record: &CostRecord) -> bool {
        match self {
            Self::Global => true,
            Self::PerUser { user_id } => record.user_id() == user_id,
            Self::PerProvider { provider } => record.provider_name() == provider,
        }
    }
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::PerUser { user_id } => write!(f, "user:{user_id}"),
            Self::PerProvider { provider } => write!(f, "provider:{provider}"),
        }
    }
}

fn default_window_secs() -> u64 {
    budget_constants::DEFAULT_WINDOW_SECS
}

fn default_hard_stop_fraction() -> Decimal {
    Decimal::new(budget_constants::DEFAULT_HARD_STOP_BPS, 4)
}

fn default_alert_fractions() -> Vec<Decimal> {
    budget_constants::DEFAULT_ALERT_BPS
        .iter()
        .map(|&bps| Decimal::new(bps, 4))
        .collect()
}

/// Spending limit over a rolling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub scope: BudgetScope,
    pub limit_amount: Decimal,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests are denied once the projected sum would exceed `limit_amount * hard_stop_fraction`
    #[serde(default = "default_hard_stop_fraction")]
    pub hard_stop_fraction: Decimal,
    /// Advisory thresholds, ascending, each below `hard_stop_fraction`
    #[serde(default = "default_alert_fractions")]
    pub alert_fractions: Vec<Decimal>,
}

impl BudgetPolicy {
    pub fn new(scope: BudgetScope, limit_amount: Decimal) -> Self {
        Self {
            scope,
            limit_amount,
            window_secs: default_window_secs(),
            hard_stop_fraction: default_hard_stop_fraction(),
            alert_fractions: default_alert_fractions(),
        }
    }

    pub fn with_hard_stop(mut self, fraction: Decimal) -> Self {
        self.hard_stop_fraction = fraction;
        self
    }

    pub fn with_alerts(mut self, fractions: Vec<Decimal>) -> Self {
        self.alert_fractions = fractions;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_secs = window.as_secs();
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Amount at which requests are denied
    pub fn ceiling(&self) -> Decimal {
        self.limit_amount * self.hard_stop_fraction
    }

    /// Number of alert thresholds at or below `sum`
    pub fn crossed_levels(&self, sum: Decimal) -> usize {
        self.alert_fractions
            .iter()
            .take_while(|&&fraction| sum >= self.limit_amount * fraction)
            .count()
    }

    pub fn validate(&self) -> Result<()> {
        let scope = &self.scope;
        if self.limit_amount.is_sign_negative() {
            return Err(TaleError::Config(format!(
                "budget policy {scope}: limit_amount must be non-negative"
            )));
        }
        if self.window_secs == 0 {
            return Err(TaleError::Config(format!(
                "budget policy {scope}: window_secs must be greater than 0"
            )));
        }
        if self.hard_stop_fraction <= Decimal::ZERO || self.hard_stop_fraction > Decimal::ONE {
            return Err(TaleError::Config(format!(
                "budget policy {scope}: hard_stop_fraction must be in (0, 1], got {}",
                self.hard_stop_fraction
            )));
        }
        let mut previous = Decimal::ZERO;
        for &fraction in &self.alert_fractions {
            if fraction <= previous || fraction >= self.hard_stop_fraction {
                return Err(TaleError::Config(format!(
                    "budget policy {scope}: alert_fractions must be ascending, positive and below \
                     hard_stop_fraction ({}), got {:?}",
                    self.hard_stop_fraction, self.alert_fractions
                )));
            }
            previous = fraction;
        }
        Ok(())
    }
}

/// Validated, immutable set of policies
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: Vec<BudgetPolicy>,
}

impl PolicySet {
    pub fn new(policies: Vec<BudgetPolicy>) -> Result<Self> {
        for policy in &policies {
            policy.validate()?;
        }
        Ok(Self { policies })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BudgetPolicy> {
        self.policies.iter()
    }

    /// Global policies plus the user's own
    fn preflight<'a>(&'a self, user_id: &'a UserId) -> impl Iterator<Item = &'a BudgetPolicy> {
        self.policies.iter().filter(move |p| match &p.scope {
            BudgetScope::Global => true,
            BudgetScope::PerUser { user_id: scoped } => scoped == user_id,
            BudgetScope::PerProvider { .. } => false,
        })
    }

    fn for_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a BudgetPolicy> {
        self.policies.iter().filter(move |p| {
            matches!(&p.scope, BudgetScope::PerProvider { provider: scoped } if scoped == provider)
        })
    }
}

// =============================================================================
// Clearance
// =============================================================================

/// Why a request was not cleared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    HardStop {
        scope: BudgetScope,
        projected: Decimal,
        ceiling: Decimal,
    },
    LedgerUnavailable {
        message: String,
    },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardStop {
                scope,
                projected,
                ceiling,
            } => write!(
                f,
                "{scope} hard stop: projected {projected} exceeds {ceiling}"
            ),
            Self::LedgerUnavailable { message } => write!(f, "ledger unavailable: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clearance {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
}

impl Clearance {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Current standing of one policy
#[derive(Debug, Clone, Serialize)]
pub struct PolicyStatus {
    pub scope: BudgetScope,
    pub window_secs: u64,
    pub spent: Decimal,
    pub limit_amount: Decimal,
    pub ceiling: Decimal,
    pub utilization: f64,
}

impl PolicyStatus {
    pub fn summary(&self) -> String {
        format!(
            "{}: {}/{} ({:.1}%) | hard stop at {} | window {}d",
            self.scope,
            self.spent,
            self.limit_amount,
            self.utilization * 100.0,
            self.ceiling,
            self.window_secs / 86_400
        )
    }
}

// =============================================================================
// Governor
// =============================================================================

pub struct BudgetGovernor {
    ledger: SharedLedger,
    policies: ArcSwap<PolicySet>,
    emitter: SharedEmitter,
    /// Alert levels currently crossed, keyed by policy position and scope
    alert_levels: DashMap<String, usize>,
}

impl BudgetGovernor {
    pub fn new(ledger: SharedLedger, policies: PolicySet, emitter: SharedEmitter) -> Self {
        Self {
            ledger,
            policies: ArcSwap::from_pointee(policies),
            emitter,
            alert_levels: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn policies(&self) -> Arc<PolicySet> {
        self.policies.load_full()
    }

    /// Swap in a new policy set; alert tracking starts over
    pub fn reload_policies(&self, policies: PolicySet) {
        self.policies.store(Arc::new(policies));
        self.alert_levels.clear();
        debug!("Budget policies reloaded");
    }

    /// Pre-flight clearance against Global and PerUser policies
    pub async fn authorize(&self, user_id: &UserId, estimated_cost: Decimal) -> Clearance {
        let policies = self.policies.load_full();
        self.evaluate(policies.preflight(user_id), estimated_cost)
            .await
    }

    /// Clearance against PerProvider policies for the provider about to be called
    pub async fn authorize_provider(
        &self,
        user_id: &UserId,
        provider: &str,
        estimated_cost: Decimal,
    ) -> Clearance {
        let policies = self.policies.load_full();
        let clearance = self
            .evaluate(policies.for_provider(provider), estimated_cost)
            .await;
        if !clearance.allowed {
            debug!(%user_id, provider, "Provider budget denied");
        }
        clearance
    }

    async fn evaluate<'a>(
        &self,
        policies: impl Iterator<Item = &'a BudgetPolicy>,
        estimated_cost: Decimal,
    ) -> Clearance {
        for policy in policies {
            let sum = match self.ledger.windowed_sum(&policy.scope, policy.window()).await {
                Ok(sum) => sum,
                Err(e) => {
                    warn!(scope = %policy.scope, error = %e, "Ledger unavailable, denying request");
                    return Clearance::deny(DenialReason::LedgerUnavailable {
                        message: e.to_string(),
                    });
                }
            };

            let projected = sum + estimated_cost;
            let ceiling = policy.ceiling();
            if projected > ceiling {
                return Clearance::deny(DenialReason::HardStop {
                    scope: policy.scope.clone(),
                    projected,
                    ceiling,
                });
            }
        }
        Clearance::allow()
    }

    /// Write the actual cost of an attempt and evaluate alert thresholds.
    ///
    /// Returns the recorded amount. Alert evaluation never fails the call.
    pub async fn record_actual(
        &self,
        record: CostRecord,
        estimated_cost: Decimal,
    ) -> std::result::Result<Decimal, LedgerError> {
        let amount = record.cost_amount();
        debug!(
            provider = record.provider_name(),
            user_id = %record.user_id(),
            %amount,
            %estimated_cost,
            delta = %(amount - estimated_cost),
            "Recording actual cost"
        );

        let policies = self.policies.load_full();
        let touched: Vec<(usize, &BudgetPolicy)> = policies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.scope.matches(&record))
            .collect();

        self.ledger.record(record).await?;

        for (index, policy) in touched {
            self.check_alerts(index, policy).await;
        }
        Ok(amount)
    }

    async fn check_alerts(&self, index: usize, policy: &BudgetPolicy) {
        if policy.alert_fractions.is_empty() {
            return;
        }

        let sum = match self.ledger.windowed_sum(&policy.scope, policy.window()).await {
            Ok(sum) => sum,
            Err(e) => {
                warn!(scope = %policy.scope, error = %e, "Skipping alert check, ledger unavailable");
                return;
            }
        };

        let crossed = policy.crossed_levels(sum);
        let previous = {
            let mut level = self
                .alert_levels
                .entry(format!("{index}:{}", policy.scope))
                .or_insert(0);
            std::mem::replace(&mut *level, crossed)
        };

        for &threshold in policy
            .alert_fractions
            .iter()
            .take(crossed)
            .skip(previous)
        {
            emit_quietly(
                self.emitter.as_ref(),
                &TelemetryEvent::BudgetAlertRaised {
                    scope: policy.scope.clone(),
                    threshold,
                    windowed_sum: sum,
                    limit_amount: policy.limit_amount,
                },
            );
        }
    }

    /// Standing of every policy that applies to the user
    pub async fn status(
        &self,
        user_id: &UserId,
    ) -> std::result::Result<Vec<PolicyStatus>, LedgerError> {
        let policies = self.policies.load_full();
        let mut statuses = Vec::new();
        for policy in policies.iter().filter(|p| match &p.scope {
            BudgetScope::PerUser { user_id: scoped } => scoped == user_id,
            _ => true,
        }) {
            let spent = self
                .ledger
                .windowed_sum(&policy.scope, policy.window())
                .await?;
            let utilization = if policy.limit_amount.is_zero() {
                0.0
            } else {
                (spent / policy.limit_amount).to_f64().unwrap_or(0.0)
            };
            statuses.push(PolicyStatus {
                scope: policy.scope.clone(),
                window_secs: policy.window_secs,
                spent,
                limit_amount: policy.limit_amount,
                ceiling: policy.ceiling(),
                utilization,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{ProviderConfig, ProviderKind};
    use crate::ai::telemetry::testing::RecordingEmitter;
    use crate::storage::{CostLedger, MemoryLedger};
    use crate::storage::ledger::testing::FlakyLedger;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    /// One unit of currency per input token
    fn unit_provider(name: &str) -> ProviderConfig {
        ProviderConfig::new(name, ProviderKind::OpenAi).with_rates(Decimal::ONE, Decimal::ZERO)
    }

    fn spend(provider: &str, user: &str, amount: u32) -> CostRecord {
        CostRecord::new(&unit_provider(provider), UserId::from(user), amount, 0)
    }

    fn governor(
        ledger: SharedLedger,
        policies: Vec<BudgetPolicy>,
    ) -> (BudgetGovernor, Arc<RecordingEmitter>) {
        let emitter = Arc::new(RecordingEmitter::default());
        let governor = BudgetGovernor::new(ledger, PolicySet::new(policies).unwrap(), emitter.clone());
        (governor, emitter)
    }

    #[test]
    fn test_policy_defaults_and_validation() {
        let policy = BudgetPolicy::new(BudgetScope::Global, Decimal::from(100));
        assert!(policy.validate().is_ok());
        assert_eq!(policy.ceiling(), dec("95"));
        assert_eq!(policy.window(), Duration::from_secs(30 * 24 * 60 * 60));

        let over_one = policy.clone().with_hard_stop(dec("1.1"));
        assert!(over_one.validate().is_err());

        let unordered = policy.clone().with_alerts(vec![dec("0.8"), dec("0.5")]);
        assert!(unordered.validate().is_err());

        let above_stop = policy.with_hard_stop(dec("0.9")).with_alerts(vec![dec("0.9")]);
        assert!(above_stop.validate().is_err());
    }

    #[test]
    fn test_policy_deserializes_from_toml() {
        let policy: BudgetPolicy = toml::from_str(
            r#"
            scope = { kind = "per_user", user_id = "alice" }
            limit_amount = "25.50"
            hard_stop_fraction = "0.9"
            "#,
        )
        .unwrap();
        assert_eq!(
            policy.scope,
            BudgetScope::PerUser {
                user_id: "alice".into()
            }
        );
        assert_eq!(policy.limit_amount, dec("25.50"));
        assert_eq!(policy.alert_fractions.len(), 4);
    }

    #[tokio::test]
    async fn test_denies_when_projection_exceeds_hard_stop() {
        // limit 10, hard stop 0.9, 9.5 already spent
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .record(CostRecord::new(
                &ProviderConfig::new("p", ProviderKind::OpenAi).with_rates(dec("0.5"), Decimal::ZERO),
                "u".into(),
                19,
                0,
            ))
            .await
            .unwrap();
        let policy = BudgetPolicy::new(
            BudgetScope::PerUser {
                user_id: "u".into(),
            },
            Decimal::from(10),
        )
        .with_hard_stop(dec("0.9"))
        .with_alerts(Vec::new());
        let (governor, _) = governor(ledger, vec![policy]);

        let clearance = governor.authorize(&"u".into(), Decimal::ZERO).await;
        assert!(!clearance.allowed);
        assert!(matches!(
            clearance.reason,
            Some(DenialReason::HardStop { ceiling, .. }) if ceiling == dec("9.0")
        ));

        // Another user is unaffected
        assert!(governor.authorize(&"v".into(), Decimal::ZERO).await.allowed);
    }

    #[tokio::test]
    async fn test_projection_at_ceiling_is_allowed() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.record(spend("p", "u", 5)).await.unwrap();
        let policy = BudgetPolicy::new(BudgetScope::Global, Decimal::from(10))
            .with_hard_stop(Decimal::ONE)
            .with_alerts(Vec::new());
        let (governor, _) = governor(ledger, vec![policy]);

        assert!(governor.authorize(&"u".into(), Decimal::from(5)).await.allowed);
        assert!(!governor.authorize(&"u".into(), Decimal::from(6)).await.allowed);
    }

    #[tokio::test]
    async fn test_provider_policies_only_checked_per_provider() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.record(spend("pricey", "u", 100)).await.unwrap();
        let policy = BudgetPolicy::new(
            BudgetScope::PerProvider {
                provider: "pricey".to_string(),
            },
            Decimal::from(50),
        );
        let (governor, _) = governor(ledger, vec![policy]);

        assert!(governor.authorize(&"u".into(), Decimal::ONE).await.allowed);
        assert!(
            !governor
                .authorize_provider(&"u".into(), "pricey", Decimal::ONE)
                .await
                .allowed
        );
        assert!(
            governor
                .authorize_provider(&"u".into(), "cheap", Decimal::ONE)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn test_no_policies_always_allows() {
        let (governor, _) = governor(Arc::new(MemoryLedger::new()), Vec::new());
        assert_eq!(
            governor.authorize(&"u".into(), Decimal::from(1_000_000)).await,
            Clearance::allow()
        );
    }

    #[tokio::test]
    async fn test_alerts_fire_once_per_level() {
        let ledger = Arc::new(MemoryLedger::new());
        let policy = BudgetPolicy::new(BudgetScope::Global, Decimal::from(100))
            .with_alerts(vec![dec("0.5"), dec("0.75"), dec("0.9")]);
        let (governor, emitter) = governor(ledger, vec![policy]);

        governor.record_actual(spend("p", "u", 40), Decimal::ZERO).await.unwrap();
        assert!(emitter.events().is_empty());

        // 40 -> 80 crosses 0.5 and 0.75 at once
        governor.record_actual(spend("p", "u", 40), Decimal::ZERO).await.unwrap();
        let thresholds: Vec<Decimal> = emitter
            .events()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::BudgetAlertRaised { threshold, .. } => Some(*threshold),
                _ => None,
            })
            .collect();
        assert_eq!(thresholds, vec![dec("0.5"), dec("0.75")]);

        // Staying above the same levels raises nothing new
        governor.record_actual(spend("p", "u", 1), Decimal::ZERO).await.unwrap();
        assert_eq!(emitter.events().len(), 2);
    }

    #[tokio::test]
    async fn test_reload_resets_alert_levels() {
        let ledger = Arc::new(MemoryLedger::new());
        let policy = BudgetPolicy::new(BudgetScope::Global, Decimal::from(10))
            .with_window(Duration::from_secs(3_600))
            .with_alerts(vec![dec("0.5")]);
        let (governor, emitter) = governor(ledger.clone(), vec![policy]);

        governor.record_actual(spend("p", "u", 6), Decimal::ZERO).await.unwrap();
        assert_eq!(emitter.events().len(), 1);

        // A larger limit puts the running sum back under every level
        governor.reload_policies(
            PolicySet::new(vec![
                BudgetPolicy::new(BudgetScope::Global, Decimal::from(100))
                    .with_alerts(vec![dec("0.5")]),
            ])
            .unwrap(),
        );
        governor.record_actual(spend("p", "u", 1), Decimal::ZERO).await.unwrap();
        assert_eq!(emitter.events().len(), 1);

        governor.record_actual(spend("p", "u", 50), Decimal::ZERO).await.unwrap();
        assert_eq!(emitter.events().len(), 2);
    }

    #[tokio::test]
    async fn test_record_actual_surfaces_write_failure() {
        let ledger = Arc::new(FlakyLedger::failing_writes());
        let (governor, emitter) = governor(
            ledger,
            vec![BudgetPolicy::new(BudgetScope::Global, Decimal::ONE)],
        );
        let result = governor.record_actual(spend("p", "u", 5), Decimal::ZERO).await;
        assert!(matches!(result, Err(LedgerError::Unavailable(_))));
        assert!(emitter.events().is_empty());
    }

    #[tokio::test]
    async fn test_status_lists_applicable_policies() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.record(spend("p", "alice", 25)).await.unwrap();
        let (governor, _) = governor(
            ledger,
            vec![
                BudgetPolicy::new(BudgetScope::Global, Decimal::from(100)),
                BudgetPolicy::new(
                    BudgetScope::PerUser {
                        user_id: "alice".into(),
                    },
                    Decimal::from(50),
                ),
                BudgetPolicy::new(
                    BudgetScope::PerUser {
                        user_id: "bob".into(),
                    },
                    Decimal::from(50),
                ),
            ],
        );

        let status = governor.status(&"alice".into()).await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].spent, Decimal::from(25));
        assert!((status[1].utilization - 0.5).abs() < f64::EPSILON);
        assert!(status[1].summary().contains("user:alice"));
    }

    proptest! {
        #[test]
        fn prop_ledger_failure_always_denies(
            limit in 0i64..1_000_000,
            estimate in 0i64..1_000,
            per_user in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let scope = if per_user {
                BudgetScope::PerUser { user_id: "u".into() }
            } else {
                BudgetScope::Global
            };
            let (governor, _) = governor(
                Arc::new(FlakyLedger::unavailable()),
                vec![BudgetPolicy::new(scope, Decimal::from(limit))],
            );
            let clearance = runtime.block_on(governor.authorize(&"u".into(), Decimal::from(estimate)));
            prop_assert!(!clearance.allowed);
            let is_ledger_unavailable = matches!(clearance.reason, Some(DenialReason::LedgerUnavailable { .. }));
            prop_assert!(is_ledger_unavailable);
        }
    }
}
