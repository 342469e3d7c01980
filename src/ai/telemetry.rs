//! Telemetry Events and Sinks
//!
//! The router and budget governor describe what happened as
//! [`TelemetryEvent`]s and hand them to a [`TelemetryEmitter`]. Emission is
//! fire-and-forget: callers go through [`emit_quietly`], which logs and
//! drops sink failures so telemetry can never fail a generation.
//!
//! ## Sinks
//!
//! - [`TracingEmitter`]: structured `tracing` log lines
//! - [`ChannelEmitter`]: bounded channel for an external consumer
//! - [`MetricsCollector`](crate::ai::metrics::MetricsCollector): in-process counters
//! - [`FanoutEmitter`]: forwards to several sinks

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::ai::budget::{BudgetScope, DenialReason};
use crate::types::{GenerationAttempt, RequestId, TelemetryError, UserId};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// One provider attempt (or pre-flight rejection) finished
    AttemptCompleted {
        request_id: RequestId,
        user_id: UserId,
        attempt_index: usize,
        attempt: GenerationAttempt,
    },
    /// A windowed sum crossed an advisory threshold
    BudgetAlertRaised {
        scope: BudgetScope,
        threshold: Decimal,
        windowed_sum: Decimal,
        limit_amount: Decimal,
    },
    RequestSucceeded {
        request_id: RequestId,
        user_id: UserId,
        provider: String,
        attempts: usize,
        cost: Decimal,
    },
    /// Every provider failed; carries the full attempt log
    RequestExhausted {
        request_id: RequestId,
        user_id: UserId,
        attempts: Vec<GenerationAttempt>,
    },
    RequestRejected {
        request_id: RequestId,
        user_id: UserId,
        reason: DenialReason,
    },
    /// The caller cancelled; carries the attempts made before cancellation
    RequestCancelled {
        request_id: RequestId,
        user_id: UserId,
        attempts: Vec<GenerationAttempt>,
    },
    /// Money was spent but could not be written to the ledger
    LedgerWriteFailed {
        request_id: RequestId,
        provider: String,
        amount: Decimal,
        message: String,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttemptCompleted { .. } => "attempt_completed",
            Self::BudgetAlertRaised { .. } => "budget_alert_raised",
            Self::RequestSucceeded { .. } => "request_succeeded",
            Self::RequestExhausted { .. } => "request_exhausted",
            Self::RequestRejected { .. } => "request_rejected",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::LedgerWriteFailed { .. } => "ledger_write_failed",
        }
    }
}

// =============================================================================
// Emitter Trait
// =============================================================================

pub trait TelemetryEmitter: Send + Sync {
    /// Accept an event. Must not block.
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

pub type SharedEmitter = Arc<dyn TelemetryEmitter>;

/// Emit and swallow any failure
pub fn emit_quietly(emitter: &dyn TelemetryEmitter, event: &TelemetryEvent) {
    if let Err(e) = emitter.emit(event) {
        warn!(event = event.name(), error = %e, "Telemetry emission failed");
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl TelemetryEmitter for NullEmitter {
    fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// =============================================================================
// Tracing Sink
// =============================================================================

/// Writes each event as a structured log line under the `talegate::telemetry` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl TelemetryEmitter for TracingEmitter {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        match event {
            TelemetryEvent::AttemptCompleted {
                request_id,
                attempt_index,
                attempt,
                ..
            } => info!(
                target: "talegate::telemetry",
                %request_id,
                attempt_index,
                provider = attempt.provider_name.as_deref().unwrap_or("-"),
                outcome = attempt.outcome_label(),
                latency_ms = attempt.latency_ms(),
                "attempt completed"
            ),
            TelemetryEvent::BudgetAlertRaised {
                scope,
                threshold,
                windowed_sum,
                limit_amount,
            } => warn!(
                target: "talegate::telemetry",
                %scope,
                %threshold,
                %windowed_sum,
                %limit_amount,
                "budget alert raised"
            ),
            TelemetryEvent::RequestSucceeded {
                request_id,
                user_id,
                provider,
                attempts,
                cost,
            } => info!(
                target: "talegate::telemetry",
                %request_id,
                %user_id,
                provider = %provider,
                attempts,
                %cost,
                "request succeeded"
            ),
            TelemetryEvent::RequestExhausted {
                request_id,
                user_id,
                attempts,
            } => warn!(
                target: "talegate::telemetry",
                %request_id,
                %user_id,
                attempts = attempts.len(),
                "request exhausted all providers"
            ),
            TelemetryEvent::RequestRejected {
                request_id,
                user_id,
                reason,
            } => warn!(
                target: "talegate::telemetry",
                %request_id,
                %user_id,
                %reason,
                "request rejected by budget"
            ),
            TelemetryEvent::RequestCancelled {
                request_id,
                user_id,
                attempts,
            } => info!(
                target: "talegate::telemetry",
                %request_id,
                %user_id,
                attempts = attempts.len(),
                "request cancelled"
            ),
            TelemetryEvent::LedgerWriteFailed {
                request_id,
                provider,
                amount,
                message,
            } => warn!(
                target: "talegate::telemetry",
                %request_id,
                provider = %provider,
                %amount,
                error = %message,
                "ledger write failed"
            ),
        }
        Ok(())
    }
}

// =============================================================================
// Channel Sink
// =============================================================================

/// Pushes events into a bounded channel; a full or closed channel is an error
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: mpsc::Sender<TelemetryEvent>,
}

impl ChannelEmitter {
    pub fn new(sender: mpsc::Sender<TelemetryEvent>) -> Self {
        Self { sender }
    }

    /// Create an emitter and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

impl TelemetryEmitter for ChannelEmitter {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.sender.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => TelemetryError::ChannelFull,
            TrySendError::Closed(_) => TelemetryError::ChannelClosed,
        })
    }
}

// =============================================================================
// Fanout
// =============================================================================

/// Forwards every event to all sinks, continuing past failures
#[derive(Default, Clone)]
pub struct FanoutEmitter {
    sinks: Vec<SharedEmitter>,
}

impl FanoutEmitter {
    pub fn new(sinks: Vec<SharedEmitter>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: SharedEmitter) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetryEmitter for FanoutEmitter {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.emit(event).err())
            .map(|e| e.to_string())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Sink(failures.join("; ")))
        }
    }
}

// =============================================================================
// Test Support
// =============================================================================
