//! Retry utilities with exponential backoff

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::LspError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Execute an async operation with retry and exponential backoff.
///
/// Only recoverable errors (timeouts, cancellations, content modified) are
/// retried; anything else is returned at once.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, op: F) -> Result<T, LspError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LspError>>,
{
    with_retry_if(config, op, LspError::is_recoverable).await
}

/// Like [`with_retry`], retrying only errors accepted by `should_retry`
pub async fn with_retry_if<F, T, Fut, P>(
    config: &RetryConfig,
    mut op: F,
    should_retry: P,
) -> Result<T, LspError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LspError>>,
    P: Fn(&LspError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) if should_retry(&e) && attempt + 1 < max_attempts => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}",
                    attempt + 1,
                    max_attempts,
                    e
                );
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    "Retry attempt {}/{} after {:?}",
                    attempt + 1,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout() -> LspError {
        LspError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_successful_first_attempt() {
        let config = RetryConfig::default();
        let result = with_retry(&config, || async { Ok::<_, LspError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_recoverable_error() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let c = counter_clone.clone();
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 { Err(timeout()) } else { Ok(42) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(timeout())
            }
        })
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_non_recoverable_error() {
        let config = RetryConfig::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(LspError::Protocol("not recoverable".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_stops_when_predicate_refuses() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry_if(
            &config,
            || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(LspError::RequestCancelled)
                }
            },
            |e| e.is_recoverable() && counter.load(Ordering::SeqCst) < 2,
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1000)); // capped
    }

    #[test]
    fn test_no_retry_config() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }
}
