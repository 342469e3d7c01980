//! Generation Metrics Collection
//!
//! In-process counters fed by telemetry events. Thread-safe for concurrent
//! requests: counters are atomics, spend is an exact `Decimal` behind a mutex.
//!
//! ## Usage
//!
//! ```ignore
//! let metrics = create_shared_metrics("session-123");
//! let emitter = FanoutEmitter::default().with(metrics.clone());
//! // ... route requests ...
//! println!("{}", metrics.snapshot().display());
//! ```

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::ai::telemetry::{TelemetryEmitter, TelemetryEvent};
use crate::types::{AttemptOutcome, TelemetryError};

// =============================================================================
// Metrics Collector
// =============================================================================

pub struct MetricsCollector {
    session_id: String,
    start_time: Instant,
    requests_succeeded: AtomicU64,
    requests_exhausted: AtomicU64,
    requests_rejected: AtomicU64,
    requests_cancelled: AtomicU64,
    attempts: AtomicU64,
    attempt_failures: AtomicU64,
    quality_rejections: AtomicU64,
    budget_alerts: AtomicU64,
    ledger_write_failures: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    total_cost: Mutex<Decimal>,
    /// Successful responses per provider
    provider_wins: DashMap<String, u64>,
}

/// Per-provider share of successful responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderShare {
    pub provider: String,
    pub successes: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub session_id: String,
    pub total_duration_ms: u64,
    pub requests_succeeded: u64,
    pub requests_exhausted: u64,
    pub requests_rejected: u64,
    pub requests_cancelled: u64,
    pub attempts: u64,
    pub attempt_failures: u64,
    pub quality_rejections: u64,
    pub budget_alerts: u64,
    pub ledger_write_failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub total_cost: Decimal,
    pub providers: Vec<ProviderShare>,
}

impl MetricsCollector {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Instant::now(),
            requests_succeeded: AtomicU64::new(0),
            requests_exhausted: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            attempt_failures: AtomicU64::new(0),
            quality_rejections: AtomicU64::new(0),
            budget_alerts: AtomicU64::new(0),
            ledger_write_failures: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            total_cost: Mutex::new(Decimal::ZERO),
            provider_wins: DashMap::new(),
        }
    }

    /// Fold one event into the counters
    pub fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::AttemptCompleted { attempt, .. } => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                if let Some(latency) = attempt.latency_ms() {
                    self.total_latency_ms.fetch_add(latency, Ordering::Relaxed);
                }
                match &attempt.outcome {
                    AttemptOutcome::Success {
                        tokens_in,
                        tokens_out,
                        ..
                    } => {
                        self.input_tokens
                            .fetch_add(u64::from(*tokens_in), Ordering::Relaxed);
                        self.output_tokens
                            .fetch_add(u64::from(*tokens_out), Ordering::Relaxed);
                        if !attempt.passed_quality() {
                            self.quality_rejections.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    AttemptOutcome::Failure { .. } | AttemptOutcome::Timeout { .. } => {
                        self.attempt_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    AttemptOutcome::BudgetRejected { .. } | AttemptOutcome::Cancelled => {}
                }
                if let Some(cost) = attempt.cost {
                    self.add_cost(cost);
                }
            }
            TelemetryEvent::RequestSucceeded { provider, .. } => {
                self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                *self.provider_wins.entry(provider.clone()).or_insert(0) += 1;
            }
            TelemetryEvent::RequestExhausted { .. } => {
                self.requests_exhausted.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::RequestRejected { .. } => {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::RequestCancelled { .. } => {
                self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::BudgetAlertRaised { .. } => {
                self.budget_alerts.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::LedgerWriteFailed { .. } => {
                self.ledger_write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn add_cost(&self, amount: Decimal) {
        let mut total = self.total_cost.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Metrics total_cost Mutex poisoned, recovering");
            poisoned.into_inner()
        });
        *total += amount;
    }

    pub fn snapshot(&self) -> MetricsSummary {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let avg_latency = if attempts > 0 {
            total_latency as f64 / attempts as f64
        } else {
            0.0
        };

        let total_cost = *self
            .total_cost
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut providers: Vec<ProviderShare> = self
            .provider_wins
            .iter()
            .map(|entry| ProviderShare {
                provider: entry.key().clone(),
                successes: *entry.value(),
            })
            .collect();
        providers.sort_by(|a, b| b.successes.cmp(&a.successes).then(a.provider.cmp(&b.provider)));

        MetricsSummary {
            session_id: self.session_id.clone(),
            total_duration_ms: self.start_time.elapsed().as_millis() as u64,
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_exhausted: self.requests_exhausted.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            attempts,
            attempt_failures: self.attempt_failures.load(Ordering::Relaxed),
            quality_rejections: self.quality_rejections.load(Ordering::Relaxed),
            budget_alerts: self.budget_alerts.load(Ordering::Relaxed),
            ledger_write_failures: self.ledger_write_failures.load(Ordering::Relaxed),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            avg_latency_ms: avg_latency,
            total_cost,
            providers,
        }
    }
}

impl TelemetryEmitter for MetricsCollector {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.record(event);
        Ok(())
    }
}

impl MetricsSummary {
    pub fn display(&self) -> String {
        let providers = if self.providers.is_empty() {
            "-".to_string()
        } else {
            self.providers
                .iter()
                .map(|p| format!("{}={}", p.provider, p.successes))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "Session: {}\n\
             Duration: {:.1}s\n\
             Requests: {} ok, {} exhausted, {} rejected, {} cancelled\n\
             Attempts: {} ({} failed, {} quality rejected)\n\
             Tokens: {} (input: {}, output: {})\n\
             Avg Latency: {:.0}ms\n\
             Spend: {}\n\
             Providers: {}",
            self.session_id,
            self.total_duration_ms as f64 / 1000.0,
            self.requests_succeeded,
            self.requests_exhausted,
            self.requests_rejected,
            self.requests_cancelled,
            self.attempts,
            self.attempt_failures,
            self.quality_rejections,
            self.total_tokens,
            self.input_tokens,
            self.output_tokens,
            self.avg_latency_ms,
            self.total_cost,
            providers
        )
    }
}

// =============================================================================
// Shared Type
// =============================================================================

pub type SharedMetrics = Arc<MetricsCollector>;

pub fn create_shared_metrics(session_id: impl Into<String>) -> SharedMetrics {
    Arc::new(MetricsCollector::new(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::GeneratedContent;
    use crate::ai::quality::{IssueTag, QualityScore};
    use crate::types::{AdapterError, GenerationAttempt, RequestId, UserId};
    use chrono::Utc;

    fn attempt_event(attempt: GenerationAttempt) -> TelemetryEvent {
        TelemetryEvent::AttemptCompleted {
            request_id: RequestId::new("r"),
            user_id: UserId::from("u"),
            attempt_index: 0,
            attempt,
        }
    }

    fn success(provider: &str, score: QualityScore) -> GenerationAttempt {
        GenerationAttempt::succeeded(
            provider,
            Utc::now(),
            &GeneratedContent::new("The door creaks open.", 100, 50),
            score,
        )
        .with_cost(Decimal::new(125, 4))
    }

    #[test]
    fn test_record_attempts() {
        let metrics = MetricsCollector::new("test-session");

        metrics.record(&attempt_event(GenerationAttempt::failed(
            "primary",
            Utc::now(),
            AdapterError::network("connection reset"),
        )));
        metrics.record(&attempt_event(success(
            "backup",
            QualityScore::fail(vec![IssueTag::TooShort]),
        )));
        metrics.record(&attempt_event(success("backup", QualityScore::pass())));
        metrics.record(&TelemetryEvent::RequestSucceeded {
            request_id: RequestId::new("r"),
            user_id: UserId::from("u"),
            provider: "backup".to_string(),
            attempts: 3,
            cost: Decimal::new(25, 3),
        });

        let summary = metrics.snapshot();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.attempt_failures, 1);
        assert_eq!(summary.quality_rejections, 1);
        assert_eq!(summary.input_tokens, 200);
        assert_eq!(summary.total_tokens, 300);
        assert_eq!(summary.total_cost, Decimal::new(25, 3));
        assert_eq!(summary.requests_succeeded, 1);
        assert_eq!(
            summary.providers,
            vec![ProviderShare {
                provider: "backup".to_string(),
                successes: 1
            }]
        );
    }

    #[test]
    fn test_concurrent_recording() {
        use std::thread;

        let metrics = create_shared_metrics("concurrent-test");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.emit(&attempt_event(success("p", QualityScore::pass())))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let summary = metrics.snapshot();
        assert_eq!(summary.attempts, 1000);
        assert_eq!(summary.input_tokens, 100_000);
        assert_eq!(summary.output_tokens, 50_000);
        // 1000 * 0.0125, exact
        assert_eq!(summary.total_cost, Decimal::new(125, 1));
    }

    #[test]
    fn test_summary_display() {
        let metrics = MetricsCollector::new("display-test");
        metrics.record(&attempt_event(success("p", QualityScore::pass())));

        let display = metrics.snapshot().display();
        assert!(display.contains("display-test"));
        assert!(display.contains("150"));
        assert!(display.contains("Providers: -"));
    }

    #[test]
    fn test_cancelled_requests_are_counted() {
        let metrics = MetricsCollector::new("cancel");
        metrics.record(&TelemetryEvent::RequestCancelled {
            request_id: RequestId::new("r"),
            user_id: UserId::from("u"),
            attempts: Vec::new(),
        });

        let summary = metrics.snapshot();
        assert_eq!(summary.requests_cancelled, 1);
        assert_eq!(summary.requests_exhausted, 0);
        assert!(summary.display().contains("1 cancelled"));
    }
}
