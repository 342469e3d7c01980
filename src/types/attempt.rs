//! Attempt log and result types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{AdapterError, RequestId};
use crate::ai::budget::DenialReason;
use crate::ai::provider::GeneratedContent;
use crate::ai::quality::QualityScore;

/// How an attempt ended. Exactly one tag per attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Provider returned content (it may still have failed quality scoring)
    Success {
        text: String,
        tokens_in: u32,
        tokens_out: u32,
        estimated: bool,
    },
    Failure {
        reason: AdapterError,
    },
    Timeout {
        after_ms: u64,
    },
    /// Budget governor vetoed the attempt; no provider was contacted
    BudgetRejected {
        reason: DenialReason,
    },
    /// Caller abandoned the request while this attempt was in flight
    Cancelled,
}

/// One provider invocation within a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationAttempt {
    /// `None` only for a pre-flight budget rejection
    pub provider_name: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Absent on timeout and cancellation
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    /// Present only when `outcome` is `Success`
    pub quality_score: Option<QualityScore>,
    /// Ledger amount written for this attempt, if any
    pub cost: Option<Decimal>,
}

impl GenerationAttempt {
    pub fn succeeded(
        provider: impl Into<String>,
        started_at: DateTime<Utc>,
        content: &GeneratedContent,
        quality: QualityScore,
    ) -> Self {
        Self {
            provider_name: Some(provider.into()),
            started_at,
            ended_at: Some(end_time(started_at)),
            outcome: AttemptOutcome::Success {
                text: content.text.clone(),
                tokens_in: content.tokens_in,
                tokens_out: content.tokens_out,
                estimated: content.estimated,
            },
            quality_score: Some(quality),
            cost: None,
        }
    }

    /// Adapter failure; a timeout is recorded under its own tag without an end time
    pub fn failed(
        provider: impl Into<String>,
        started_at: DateTime<Utc>,
        reason: AdapterError,
    ) -> Self {
        let (outcome, ended_at) = match reason {
            AdapterError::Timeout { after_ms } => (AttemptOutcome::Timeout { after_ms }, None),
            other => (
                AttemptOutcome::Failure { reason: other },
                Some(end_time(started_at)),
            ),
        };
        Self {
            provider_name: Some(provider.into()),
            started_at,
            ended_at,
            outcome,
            quality_score: None,
            cost: None,
        }
    }

    pub fn budget_rejected(provider: Option<String>, reason: DenialReason) -> Self {
        let now = Utc::now();
        Self {
            provider_name: provider,
            started_at: now,
            ended_at: Some(now),
            outcome: AttemptOutcome::BudgetRejected { reason },
            quality_score: None,
            cost: None,
        }
    }

    pub fn cancelled(provider: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            provider_name: Some(provider.into()),
            started_at,
            ended_at: None,
            outcome: AttemptOutcome::Cancelled,
            quality_score: None,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }

    /// Content came back and passed quality scoring
    pub fn passed_quality(&self) -> bool {
        self.quality_score.as_ref().is_some_and(|q| q.passed)
    }

    pub fn is_budget_rejected(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::BudgetRejected { .. })
    }

    /// Wall-clock duration, when the attempt has an end time
    pub fn latency_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    /// Short label used in logs and metrics
    pub fn outcome_label(&self) -> &'static str {
        match &self.outcome {
            AttemptOutcome::Success { .. } if self.passed_quality() => "success",
            AttemptOutcome::Success { .. } => "quality_rejected",
            AttemptOutcome::Failure { .. } => "failure",
            AttemptOutcome::Timeout { .. } => "timeout",
            AttemptOutcome::BudgetRejected { .. } => "budget_rejected",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

fn end_time(started_at: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(started_at)
}

/// Successful outcome of `generate_narrative`
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub request_id: RequestId,
    pub provider_name: String,
    pub content: GeneratedContent,
    pub quality: QualityScore,
    /// Amount recorded in the ledger for the winning attempt
    pub cost: Decimal,
    /// Every attempt in order, the winning one last
    pub attempts: Vec<GenerationAttempt>,
}
