//! Timeout helpers for provider calls
//!
//! Adapters wrap their outbound request in [`with_timeout`] so an expired
//! deadline always surfaces as [`AdapterError::Timeout`] instead of a
//! transport error.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::with_timeout;
//!
//! let content = with_timeout(timeout, async { self.send(body).await }).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::types::AdapterError;

/// Execute an adapter operation with a timeout
///
/// Returns `AdapterError::Timeout` if the operation doesn't complete within
/// the specified duration. The inner future is dropped on expiry, which
/// aborts any in-flight HTTP request it owns.
pub async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::timeout(timeout)),
    }
}

/// Guard deadline the router applies on top of an adapter's own timeout
pub fn guard_timeout(timeout: Duration, grace: Duration) -> Duration {
    timeout.saturating_add(grace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, AdapterError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, AdapterError>(42)
        })
        .await;
        assert_eq!(result.unwrap_err(), AdapterError::Timeout { after_ms: 10 });
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<(), _> = with_timeout(Duration::from_secs(1), async {
            Err(AdapterError::network("reset"))
        })
        .await;
        assert!(matches!(result, Err(AdapterError::Network { .. })));
    }

    #[test]
    fn test_guard_timeout_adds_grace() {
        assert_eq!(
            guard_timeout(Duration::from_millis(1000), Duration::from_millis(250)),
            Duration::from_millis(1250)
        );
    }
}
