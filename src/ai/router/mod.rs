//! Provider Router
//!
//! Orchestrates one narrative generation request across the configured
//! providers.
//!
//! ## Request lifecycle
//!
//! 1. **Init**: validate prompt, history length and attempt bound
//! 2. **Budget check**: pre-flight clearance for Global and PerUser policies
//! 3. **Attempting**: providers in priority order, strictly one at a time
//!    - skip providers whose circuit breaker is open or disabled
//!    - per-provider budget clearance
//!    - adapter call under a guard timeout and the caller's cancellation token
//!    - quality scoring; billable responses are written to the ledger
//! 4. **Succeeded** with the first passing response, or **Exhausted**
//!
//! The provider list is an immutable snapshot sorted once at load time and
//! swapped atomically on reload.

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ai::budget::{BudgetGovernor, DenialReason, PolicySet};
use crate::ai::provider::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, GeneratedContent, ProviderConfig,
    SharedAdapter, create_adapter,
};
use crate::ai::quality::{QualityConstraints, QualityScorer};
use crate::ai::telemetry::{NullEmitter, SharedEmitter, TelemetryEvent, emit_quietly};
use crate::ai::timeout::{guard_timeout, with_timeout};
use crate::ai::tokenizer::estimate_request_tokens;
use crate::config::{Config, RouterConfig};
use crate::storage::{CostRecord, MemoryLedger, SharedLedger};
use crate::types::{
    GenerationAttempt, GenerationRequest, GenerationResult, Result, TaleError,
    ValidationError, ValidationErrorKind,
};


// =============================================================================
// Provider Snapshot
// =============================================================================

/// A configured provider and the adapter that talks to it
#[derive(Clone)]
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub adapter: SharedAdapter,
}

impl ProviderEntry {
    pub fn new(config: ProviderConfig, adapter: SharedAdapter) -> Self {
        Self { config, adapter }
    }

    /// Build the adapter for `config.kind`
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let adapter = create_adapter(&config)?;
        Ok(Self { config, adapter })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Pre-flight cost estimate: estimated prompt tokens plus the full
    /// completion allowance
    pub fn estimate_cost(&self, request: &GenerationRequest) -> Decimal {
        let tokens_in = estimate_request_tokens(request.prompt(), request.context_history());
        self.config.cost_for(tokens_in, self.config.max_tokens)
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("config", &self.config)
            .field("model", &self.adapter.model())
            .finish()
    }
}

/// Validate names and sort by priority; ties keep insertion order
fn sorted_snapshot(mut entries: Vec<ProviderEntry>) -> Result<Vec<ProviderEntry>> {
    let mut seen = HashSet::new();
    for entry in &entries {
        if !seen.insert(entry.name().to_string()) {
            return Err(TaleError::Config(format!(
                "duplicate provider name '{}'",
                entry.name()
            )));
        }
    }
    entries.sort_by_key(|entry| entry.config.priority);
    Ok(entries)
}

// =============================================================================
// Router
// =============================================================================

pub struct ProviderRouter {
    providers: ArcSwap<Vec<ProviderEntry>>,
    /// One breaker per provider name, created on first use
    breakers: DashMap<String, CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    settings: RouterConfig,
    quality: QualityConstraints,
    governor: Arc<BudgetGovernor>,
    emitter: SharedEmitter,
}

impl ProviderRouter {
    pub fn builder() -> ProviderRouterBuilder {
        ProviderRouterBuilder::new()
    }

    /// Build adapters, policies and quality constraints from loaded configuration
    pub fn from_config(config: &Config, ledger: SharedLedger, emitter: SharedEmitter) -> Result<Self> {
        let entries = config
            .providers
            .iter()
            .cloned()
            .map(ProviderEntry::from_config)
            .collect::<Result<Vec<_>>>()?;
        let policies = PolicySet::new(config.budget.policies.clone())?;
        let governor = Arc::new(BudgetGovernor::new(ledger, policies, emitter.clone()));

        ProviderRouter::builder()
            .providers(entries)
            .settings(config.router.clone())
            .quality(QualityConstraints::from_config(&config.quality)?)
            .governor(governor)
            .emitter(emitter)
            .build()
    }

    pub fn governor(&self) -> &Arc<BudgetGovernor> {
        &self.governor
    }

    /// Current provider order
    pub fn snapshot(&self) -> Arc<Vec<ProviderEntry>> {
        self.providers.load_full()
    }

    /// Swap in a new provider set. Breakers start fresh, which also clears
    /// providers disabled after an authentication failure.
    pub fn reload_providers(&self, entries: Vec<ProviderEntry>) -> Result<()> {
        let snapshot = sorted_snapshot(entries)?;
        let count = snapshot.len();
        self.providers.store(Arc::new(snapshot));
        self.breakers.clear();
        info!(providers = count, "Provider snapshot reloaded");
        Ok(())
    }

    /// Breaker stats in provider order
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.snapshot()
            .iter()
            .map(|entry| {
                self.breakers
                    .entry(entry.name().to_string())
                    .or_insert_with(|| {
                        CircuitBreaker::new(entry.name(), self.breaker_config.clone())
                    })
                    .stats()
            })
            .collect()
    }

    pub async fn generate_narrative(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        self.generate_narrative_with_cancel(request, CancellationToken::new())
            .await
    }

    #[instrument(
        skip_all,
        fields(request_id = %request.request_id(), user_id = %request.user_id())
    )]
    pub async fn generate_narrative_with_cancel(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationResult> {
        self.validate(request)?;

        let snapshot = self.providers.load_full();
        let mut attempts = Vec::new();

        // ---------------------------------------------------------------------
        // Budget check
        // ---------------------------------------------------------------------
        let estimated = snapshot
            .iter()
            .find(|entry| self.breaker_would_allow(entry.name()))
            .or_else(|| snapshot.first())
            .map(|entry| entry.estimate_cost(request))
            .unwrap_or(Decimal::ZERO);

        let clearance = self.governor.authorize(request.user_id(), estimated).await;
        if let Some(reason) = clearance.reason {
            self.log_attempt(
                request,
                &mut attempts,
                GenerationAttempt::budget_rejected(None, reason.clone()),
            );
            return Err(self.reject(request, reason));
        }

        // ---------------------------------------------------------------------
        // Attempting
        // ---------------------------------------------------------------------
        let max_attempts = request.max_attempts().unwrap_or(snapshot.len());
        let grace = Duration::from_millis(self.settings.timeout_grace_ms);
        let mut contacted = 0usize;
        let mut provider_denial: Option<DenialReason> = None;

        for entry in snapshot.iter() {
            if contacted >= max_attempts {
                debug!(max_attempts, "Attempt limit reached");
                break;
            }
            if cancel.is_cancelled() {
                return Err(self.cancelled(request, attempts));
            }

            let name = entry.name();
            if !self.breaker_allows(name) {
                debug!(provider = name, "Skipping provider, circuit not closed");
                continue;
            }

            let estimate = entry.estimate_cost(request);
            let clearance = self
                .governor
                .authorize_provider(request.user_id(), name, estimate)
                .await;
            if let Some(reason) = clearance.reason {
                self.with_breaker(name, CircuitBreaker::release_probe);
                info!(provider = name, %reason, "Provider budget exhausted, skipping");
                self.log_attempt(
                    request,
                    &mut attempts,
                    GenerationAttempt::budget_rejected(Some(name.to_string()), reason.clone()),
                );
                provider_denial.get_or_insert(reason);
                continue;
            }

            contacted += 1;
            let started_at = Utc::now();
            let timeout = entry.config.timeout();
            debug!(provider = name, attempt = contacted, "Calling provider");

            let call = entry.adapter.generate(
                request.prompt(),
                request.context_history(),
                entry.config.max_tokens,
                timeout,
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = with_timeout(guard_timeout(timeout, grace), call) => Some(result),
            };

            let content = match outcome {
                None => {
                    self.with_breaker(name, CircuitBreaker::release_probe);
                    info!(provider = name, "Request cancelled during provider call");
                    self.log_attempt(
                        request,
                        &mut attempts,
                        GenerationAttempt::cancelled(name, started_at),
                    );
                    return Err(self.cancelled(request, attempts));
                }
                Some(Err(err)) => {
                    if err.disables_provider() {
                        self.with_breaker(name, CircuitBreaker::disable);
                    } else if err.counts_as_provider_failure() {
                        self.with_breaker(name, CircuitBreaker::record_failure);
                    } else {
                        self.with_breaker(name, CircuitBreaker::release_probe);
                    }
                    warn!(
                        provider = name,
                        category = %err.category(),
                        error = %err,
                        "Provider attempt failed"
                    );
                    self.log_attempt(
                        request,
                        &mut attempts,
                        GenerationAttempt::failed(name, started_at, err),
                    );
                    continue;
                }
                Some(Ok(content)) => content,
            };

            // The provider answered, so it is healthy even if the text is rejected
            self.with_breaker(name, CircuitBreaker::record_success);
            let score = QualityScorer::score(&content, &self.quality);

            let mut attempt =
                GenerationAttempt::succeeded(name, started_at, &content, score.clone());
            let billable = score.passed || self.settings.record_rejected_spend;
            let mut cost = Decimal::ZERO;
            if billable {
                let (amount, written) = self
                    .record_spend(request, &entry.config, &content, estimate)
                    .await;
                cost = amount;
                if written {
                    attempt = attempt.with_cost(amount);
                }
            }
            self.log_attempt(request, &mut attempts, attempt);

            if !score.passed {
                info!(
                    provider = name,
                    issues = ?score.issues,
                    "Response rejected by quality scoring"
                );
                continue;
            }

            info!(provider = name, attempts = attempts.len(), %cost, "Narrative generated");
            emit_quietly(
                self.emitter.as_ref(),
                &TelemetryEvent::RequestSucceeded {
                    request_id: request.request_id().clone(),
                    user_id: request.user_id().clone(),
                    provider: name.to_string(),
                    attempts: attempts.len(),
                    cost,
                },
            );
            return Ok(GenerationResult {
                request_id: request.request_id().clone(),
                provider_name: name.to_string(),
                content,
                quality: score,
                cost,
                attempts,
            });
        }

        // ---------------------------------------------------------------------
        // Exhausted
        // ---------------------------------------------------------------------
        if contacted == 0
            && let Some(reason) = provider_denial
        {
            return Err(self.reject(request, reason));
        }

        warn!(attempts = attempts.len(), "All providers exhausted");
        emit_quietly(
            self.emitter.as_ref(),
            &TelemetryEvent::RequestExhausted {
                request_id: request.request_id().clone(),
                user_id: request.user_id().clone(),
                attempts: attempts.clone(),
            },
        );
        Err(TaleError::ProvidersExhausted {
            request_id: request.request_id().clone(),
            attempts,
        })
    }

    fn validate(&self, request: &GenerationRequest) -> Result<()> {
        if request.prompt().trim().is_empty() {
            return Err(
                ValidationError::new(ValidationErrorKind::MissingField, "prompt must not be empty")
                    .with_field("prompt")
                    .into(),
            );
        }

        let history = request.context_history().len();
        if history > self.settings.max_history {
            return Err(ValidationError::new(
                ValidationErrorKind::Range,
                "context history too long",
            )
            .with_field("context_history")
            .with_comparison(
                format!("at most {} turns", self.settings.max_history),
                history.to_string(),
            )
            .into());
        }

        if request.max_attempts() == Some(0) {
            return Err(ValidationError::new(
                ValidationErrorKind::Range,
                "max_attempts must be at least 1",
            )
            .with_field("max_attempts")
            .with_comparison(">= 1", "0")
            .into());
        }
        Ok(())
    }

    /// Write the cost of a billable response on a detached task, so the
    /// record survives the request future being dropped.
    ///
    /// Returns the amount and whether the ledger accepted it.
    async fn record_spend(
        &self,
        request: &GenerationRequest,
        provider: &ProviderConfig,
        content: &GeneratedContent,
        estimated: Decimal,
    ) -> (Decimal, bool) {
        let record = CostRecord::new(
            provider,
            request.user_id().clone(),
            content.tokens_in,
            content.tokens_out,
        );
        let amount = record.cost_amount();

        let governor = Arc::clone(&self.governor);
        let emitter = Arc::clone(&self.emitter);
        let request_id = request.request_id().clone();
        let provider_name = provider.name.clone();

        let task = tokio::spawn(async move {
            match governor.record_actual(record, estimated).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(provider = %provider_name, error = %e, %amount, "Failed to record spend");
                    emit_quietly(
                        emitter.as_ref(),
                        &TelemetryEvent::LedgerWriteFailed {
                            request_id,
                            provider: provider_name,
                            amount,
                            message: e.to_string(),
                        },
                    );
                    false
                }
            }
        });

        match task.await {
            Ok(written) => (amount, written),
            Err(e) => {
                warn!(error = %e, "Spend recording task failed");
                (amount, false)
            }
        }
    }

    fn reject(&self, request: &GenerationRequest, reason: DenialReason) -> TaleError {
        info!(%reason, "Request rejected by budget");
        emit_quietly(
            self.emitter.as_ref(),
            &TelemetryEvent::RequestRejected {
                request_id: request.request_id().clone(),
                user_id: request.user_id().clone(),
                reason: reason.clone(),
            },
        );
        TaleError::BudgetExceeded { reason }
    }

    fn cancelled(
        &self,
        request: &GenerationRequest,
        attempts: Vec<GenerationAttempt>,
    ) -> TaleError {
        info!(attempts = attempts.len(), "Request cancelled");
        emit_quietly(
            self.emitter.as_ref(),
            &TelemetryEvent::RequestCancelled {
                request_id: request.request_id().clone(),
                user_id: request.user_id().clone(),
                attempts: attempts.clone(),
            },
        );
        TaleError::Cancelled {
            request_id: request.request_id().clone(),
            attempts,
        }
    }

    fn log_attempt(
        &self,
        request: &GenerationRequest,
        attempts: &mut Vec<GenerationAttempt>,
        attempt: GenerationAttempt,
    ) {
        emit_quietly(
            self.emitter.as_ref(),
            &TelemetryEvent::AttemptCompleted {
                request_id: request.request_id().clone(),
                user_id: request.user_id().clone(),
                attempt_index: attempts.len(),
                attempt: attempt.clone(),
            },
        );
        attempts.push(attempt);
    }

    fn breaker_allows(&self, name: &str) -> bool {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.breaker_config.clone()))
            .allow_request()
    }

    /// Unknown providers have a fresh, closed breaker
    fn breaker_would_allow(&self, name: &str) -> bool {
        self.breakers
            .get(name)
            .is_none_or(|breaker| breaker.would_allow())
    }

    fn with_breaker(&self, name: &str, f: impl FnOnce(&CircuitBreaker)) {
        if let Some(breaker) = self.breakers.get(name) {
            f(breaker.value());
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct ProviderRouterBuilder {
    entries: Vec<ProviderEntry>,
    settings: RouterConfig,
    quality: QualityConstraints,
    governor: Option<Arc<BudgetGovernor>>,
    emitter: SharedEmitter,
}

impl ProviderRouterBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            settings: RouterConfig::default(),
            quality: QualityConstraints::default(),
            governor: None,
            emitter: Arc::new(NullEmitter),
        }
    }

    pub fn provider(mut self, entry: ProviderEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn providers(mut self, entries: impl IntoIterator<Item = ProviderEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn settings(mut self, settings: RouterConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn quality(mut self, quality: QualityConstraints) -> Self {
        self.quality = quality;
        self
    }

    pub fn governor(mut self, governor: Arc<BudgetGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn emitter(mut self, emitter: SharedEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Without an explicit governor, spend goes to an in-memory ledger with no policies
    pub fn build(self) -> Result<ProviderRouter> {
        let providers = sorted_snapshot(self.entries)?;
        let governor = self.governor.unwrap_or_else(|| {
            let ledger: SharedLedger = Arc::new(MemoryLedger::new());
            Arc::new(BudgetGovernor::new(
                ledger,
                PolicySet::empty(),
                self.emitter.clone(),
            ))
        });

        Ok(ProviderRouter {
            providers: ArcSwap::from_pointee(providers),
            breakers: DashMap::new(),
            breaker_config: CircuitBreakerConfig::from(&self.settings.circuit_breaker),
            settings: self.settings,
            quality: self.quality,
            governor,
            emitter: self.emitter,
        })
    }
}

impl Default for ProviderRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
