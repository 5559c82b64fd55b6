//! Retry with jittered exponential backoff
//!
//! Only transport-class failures are retried (`HarveyError::is_retryable`);
//! everything else propagates immediately. Exhausting the budget collapses
//! into `UpstreamUnavailable` so callers see one stable kind.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{HarveyError, Result};
use crate::session::CancelToken;

/// Retry policy shared by the downstream adapters
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (1-based), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(exp.min(self.max_delay.as_millis() as f64) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let millis = delay.as_millis() as f64;
        let spread = millis * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((millis + offset).max(0.0) as u64)
    }
}

/// Run `op` until it succeeds, fails non-retryably, exhausts the attempt
/// budget, or the token is cancelled.
pub async fn retry_request<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancelToken,
    service: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=config.max_attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(HarveyError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = config.jittered(config.delay_for_attempt(attempt));
                debug!(service, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(HarveyError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) if err.is_retryable() => {
                debug!(service, attempt, error = %err, "retry budget exhausted");
                return Err(HarveyError::UpstreamUnavailable {
                    service: service.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
    Err(HarveyError::UpstreamUnavailable {
        service: service.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(5000));
        assert_eq!(config.delay_for_attempt(12), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn transient_failures_consume_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let result: Result<()> = retry_request(&config, &CancelToken::new(), "analysis", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HarveyError::ConnectionLost {
                    message: "reset".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(HarveyError::UpstreamUnavailable { service }) if service == "analysis"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_short_circuit() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_request(&RetryConfig::default(), &CancelToken::new(), "analysis", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(HarveyError::SolverError {
                        message: "model infeasible".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(HarveyError::SolverError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let result = retry_request(&config, &CancelToken::new(), "amint", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(HarveyError::HttpStatus {
                        status: 503,
                        message: "warming up".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_beats_the_backoff_sleep() {
        let cancel = CancelToken::new();
        let config = RetryConfig {
            base_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = retry_request(&config, &cancel, "analysis", || async {
            Err(HarveyError::ConnectionLost {
                message: "reset".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(HarveyError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
