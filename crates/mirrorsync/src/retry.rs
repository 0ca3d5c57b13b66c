//! Retry utilities for remote fetches.
//!
//! Page and asset fetches retry transient errors with exponential backoff
//! and jitter; everything else fails through immediately.

use backon::ExponentialBuilder;

use crate::config::RetryConfig;

impl RetryConfig {
    /// Build an exponential backoff strategy from this configuration.
    ///
    /// `max_fetch_attempts` counts total attempts, so the backoff retries
    /// one fewer time than that.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(std::time::Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(std::time::Duration::from_millis(self.max_backoff_ms))
            .with_max_times(self.max_fetch_attempts.saturating_sub(1))
            .with_jitter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use backon::Retryable;

    use crate::config::RetryConfig;
    use crate::error::SyncError;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_fetch_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let operation = move || {
            let calls = Arc::clone(&calls_capture);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::transient("connection reset"))
                } else {
                    Ok(7u32)
                }
            }
        };

        let result = operation
            .retry(fast_config().backoff())
            .when(SyncError::is_retryable)
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let operation = move || {
            let calls = Arc::clone(&calls_capture);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::transient("still down"))
            }
        };

        let result = operation
            .retry(fast_config().backoff())
            .when(SyncError::is_retryable)
            .await;

        assert!(result.is_err());
        // max_fetch_attempts counts total attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_capture = Arc::clone(&calls);

        let operation = move || {
            let calls = Arc::clone(&calls_capture);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::fatal("store gone"))
            }
        };

        let result = operation
            .retry(fast_config().backoff())
            .when(SyncError::is_retryable)
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
