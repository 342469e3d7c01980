//! Circuit Breaker for Provider Health
//!
//! Temporarily removes a repeatedly failing provider from the fallback
//! rotation.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Provider is failing, requests are skipped
//! - **HalfOpen**: Cooldown elapsed, limited probe requests allowed
//! - **Disabled**: Provider rejected our credentials; skipped until reload
//!
//! ## Transitions
//!
//! ```text
//! Closed --[failure_threshold consecutive failures within failure_window]--> Open
//! Open --[cooldown elapsed]--> HalfOpen
//! HalfOpen --[success_threshold successes]--> Closed
//! HalfOpen --[failure]--> Open
//! any --[auth failure]--> Disabled --[reset]--> Closed
//! ```

use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerSettings;
use crate::constants::circuit_breaker as cb_constants;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Provider is failing - requests skipped
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
    /// Credentials rejected - skipped until provider reload
    Disabled,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
            Self::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Failures further apart than this restart the count
    pub failure_window: Duration,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
    /// Maximum requests allowed in half-open state
    pub half_open_max_requests: u32,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            failure_window: Duration::from_secs(cb_constants::FAILURE_WINDOW_SECS),
            cooldown: Duration::from_secs(cb_constants::COOLDOWN_SECS),
            half_open_max_requests: cb_constants::HALF_OPEN_MAX_REQUESTS,
            success_threshold: cb_constants::SUCCESS_THRESHOLD,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            failure_window: Duration::from_secs(settings.failure_window_secs),
            cooldown: Duration::from_secs(settings.cooldown_secs),
            half_open_max_requests: settings.half_open_max_requests,
            success_threshold: settings.success_threshold,
        }
    }
}

/// All mutable state in one struct so transitions are atomic
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    first_failure_at: Option<Instant>,
    success_count: u32,
    half_open_requests: u32,
    opened_at: Option<Instant>,
    blocked_count: u64,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            success_count: 0,
            half_open_requests: 0,
            opened_at: None,
            blocked_count: 0,
        }
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.first_failure_at = None;
        self.success_count = 0;
        self.half_open_requests = 0;
        self.opened_at = None;
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_requests = 0;
        self.failure_count = 0;
        self.first_failure_at = None;
    }
}

/// Thread-safe circuit breaker for one provider.
///
/// All state is protected by a single RwLock; poisoned locks are recovered.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    provider_name: String,
    inner: RwLock<CircuitBreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            provider_name: provider_name.into(),
            inner: RwLock::new(CircuitBreakerInner::new()),
        }
    }

    pub fn with_defaults(provider_name: impl Into<String>) -> Self {
        Self::new(provider_name, CircuitBreakerConfig::default())
    }

    /// Get current circuit state (checking for cooldown transitions)
    pub fn state(&self) -> CircuitState {
        self.check_state_transition();

        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    /// Whether `allow_request` would currently succeed, without reserving a
    /// half-open slot or counting a block
    pub fn would_allow(&self) -> bool {
        self.check_state_transition();

        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open | CircuitState::Disabled => false,
            CircuitState::HalfOpen => inner.half_open_requests < self.config.half_open_max_requests,
        }
    }

    /// Check if a request should be allowed; a denied request counts as blocked
    pub fn allow_request(&self) -> bool {
        self.check_state_transition();

        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open | CircuitState::Disabled => {
                inner.blocked_count += 1;
                tracing::debug!(
                    provider = %self.provider_name,
                    state = %inner.state,
                    "Circuit breaker: request blocked"
                );
                false
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    tracing::debug!(
                        provider = %self.provider_name,
                        "Circuit breaker: allowing probe request ({}/{})",
                        inner.half_open_requests,
                        self.config.half_open_max_requests
                    );
                    true
                } else {
                    inner.blocked_count += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.failure_count = 0;
        inner.first_failure_at = None;

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;

            if inner.success_count >= self.config.success_threshold {
                inner.reset();
                tracing::info!(
                    provider = %self.provider_name,
                    "Circuit breaker: closed (provider recovered)"
                );
            } else {
                // Completed probe frees its slot for the next one
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.success_count = 0;

        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                let window_expired = inner
                    .first_failure_at
                    .is_some_and(|first| now.duration_since(first) > self.config.failure_window);
                if window_expired || inner.first_failure_at.is_none() {
                    inner.failure_count = 0;
                    inner.first_failure_at = Some(now);
                }
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    tracing::warn!(
                        provider = %self.provider_name,
                        "Circuit breaker: opened after {} failures (cooldown: {:?})",
                        self.config.failure_threshold,
                        self.config.cooldown
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                tracing::warn!(
                    provider = %self.provider_name,
                    "Circuit breaker: re-opened after failure in half-open state"
                );
            }
            CircuitState::Open | CircuitState::Disabled => {}
        }
    }

    /// Return a half-open probe slot granted by `allow_request` whose call
    /// never produced an outcome
    pub fn release_probe(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
        }
    }

    /// Take the provider out of rotation until [`reset`](Self::reset)
    pub fn disable(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.state != CircuitState::Disabled {
            inner.state = CircuitState::Disabled;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                provider = %self.provider_name,
                "Circuit breaker: provider disabled after authentication failure"
            );
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        CircuitBreakerStats {
            provider_name: self.provider_name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            blocked_count: inner.blocked_count,
            time_in_state: inner.opened_at.map(|t| t.elapsed()),
        }
    }

    /// Force reset to closed state (provider reload or manual intervention)
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.reset();
        tracing::debug!(provider = %self.provider_name, "Circuit breaker: reset to CLOSED");
    }

    /// Open -> HalfOpen once the cooldown has elapsed
    fn check_state_transition(&self) {
        let should_transition = {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            inner.state == CircuitState::Open
                && inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.cooldown)
        };

        if should_transition {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // State may have changed between read and write
            if inner.state == CircuitState::Open {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_requests = 0;
                inner.success_count = 0;

                tracing::info!(
                    provider = %self.provider_name,
                    "Circuit breaker: HALF_OPEN (testing recovery)"
                );
            }
        }
    }
}

/// Statistics for monitoring circuit breaker state
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub provider_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub blocked_count: u64,
    pub time_in_state: Option<Duration>,
}

impl CircuitBreakerStats {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let time_str = self
            .time_in_state
            .map(|d| format!(" for {:.1}s", d.as_secs_f64()))
            .unwrap_or_default();

        format!(
            "[{}] {} | failures={} successes={} blocked={}{}",
            self.provider_name,
            self.state,
            self.failure_count,
            self.success_count,
            self.blocked_count,
            time_str
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        }
    }

    fn fast_recovery() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(1),
            half_open_max_requests: 1,
            success_threshold: 2,
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", config(3));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config(3));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_restart_count() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                failure_window: Duration::from_millis(5),
                ..Default::default()
            },
        );

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[test]
    fn test_half_open_limits_probes_and_closes_on_success() {
        let cb = CircuitBreaker::new("test", fast_recovery());

        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_would_allow_reserves_nothing() {
        let cb = CircuitBreaker::new("test", fast_recovery());
        assert!(cb.would_allow());

        cb.record_failure();
        assert!(!cb.would_allow());
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.would_allow());
        assert!(cb.would_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(!cb.would_allow());
        assert_eq!(cb.stats().blocked_count, 0);

        cb.disable();
        assert!(!cb.would_allow());
    }

    #[test]
    fn test_successful_probes_keep_granting_until_closed() {
        let cb = CircuitBreaker::new("test", fast_recovery());

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(10));

        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow_request());
        assert!(!cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_released_probe_can_be_reused() {
        let cb = CircuitBreaker::new("test", fast_recovery());

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.release_probe();
        assert!(cb.allow_request());
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", fast_recovery());

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.stats().state, CircuitState::Open);
    }

    #[test]
    fn test_disabled_until_reset() {
        let cb = CircuitBreaker::new("test", fast_recovery());

        cb.disable();
        std::thread::sleep(Duration::from_millis(10));
        // Cooldown never applies to a disabled provider
        assert_eq!(cb.state(), CircuitState::Disabled);
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Disabled);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_blocked_count() {
        let cb = CircuitBreaker::new("test", config(1));

        cb.record_failure();
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        let stats = cb.stats();
        assert_eq!(stats.blocked_count, 3);
        assert!(stats.summary().contains("OPEN"));
    }

    #[test]
    fn test_from_settings() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 7,
            failure_window_secs: 10,
            cooldown_secs: 3,
            half_open_max_requests: 2,
            success_threshold: 2,
        };
        let config = CircuitBreakerConfig::from(&settings);
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.failure_window, Duration::from_secs(10));
        assert_eq!(config.cooldown, Duration::from_secs(3));
    }
}
