//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Router constants
pub mod router {
    /// Maximum number of prior turns accepted in a request's context history
    pub const MAX_HISTORY: usize = 50;

    /// Extra time granted on top of a provider's own timeout before the
    /// router abandons the call (milliseconds)
    pub const TIMEOUT_GRACE_MS: u64 = 250;

    /// Whether responses that fail quality scoring are still written to the ledger
    pub const RECORD_REJECTED_SPEND: bool = true;
}

/// Circuit breaker constants
pub mod circuit_breaker {
    /// Number of consecutive failures before opening circuit
    pub const FAILURE_THRESHOLD: u32 = 5;

    /// Rolling window in which consecutive failures are counted (seconds)
    pub const FAILURE_WINDOW_SECS: u64 = 60;

    /// Duration to wait before attempting recovery (seconds)
    pub const COOLDOWN_SECS: u64 = 30;

    /// Maximum requests allowed in half-open state
    pub const HALF_OPEN_MAX_REQUESTS: u32 = 1;

    /// Success threshold to close circuit from half-open
    pub const SUCCESS_THRESHOLD: u32 = 1;
}

/// Budget policy constants
pub mod budget {
    /// Default rolling window (30 days, in seconds)
    pub const DEFAULT_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

    /// Default fraction of the limit at which requests are rejected (basis points)
    pub const DEFAULT_HARD_STOP_BPS: i64 = 9_500;

    /// Default advisory alert fractions, ascending (basis points)
    pub const DEFAULT_ALERT_BPS: [i64; 4] = [6_000, 7_500, 8_500, 9_000];
}

/// Quality scoring constants
pub mod quality {
    /// Minimum narrative length in characters
    pub const MIN_LENGTH: usize = 1;

    /// Maximum narrative length in characters
    pub const MAX_LENGTH: usize = 4_000;

    /// Terminal markers every story beat must end with
    pub const TERMINAL_MARKERS: [&str; 2] = ["(Y/N)", "(Restart?)"];
}

/// Provider defaults
pub mod provider {
    /// Default maximum completion tokens
    pub const DEFAULT_MAX_TOKENS: u32 = 1_024;

    /// Default request timeout (milliseconds)
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    /// Default sampling temperature for narrative generation
    pub const DEFAULT_TEMPERATURE: f32 = 0.8;

    /// Characters per token used by the deterministic token estimate
    pub const CHARS_PER_TOKEN: usize = 4;
}

/// Telemetry constants
pub mod telemetry {
    /// Default capacity of the channel telemetry sink
    pub const CHANNEL_CAPACITY: usize = 1_024;
}

/// Storage constants
pub mod storage {
    /// Default SQLite ledger path (relative to the project directory)
    pub const DEFAULT_LEDGER_FILE: &str = "ledger.db";
}

/// HTTP/Network constants
pub mod network {
    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
}
