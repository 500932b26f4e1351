//! Per-attempt timeouts with linear backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::ProviderError;
use crate::io::config::RetryConfig;

/// Attempt schedule for one provider call.
///
/// The number of attempts equals the number of timeouts. Attempt `n` (1-based)
/// that fails with a retryable error waits `n * backoff` before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeouts: Vec<Duration>,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            attempt_timeouts: cfg.attempt_timeouts(),
            backoff: cfg.backoff(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempt_timeouts.len()
    }

    /// Timeout of the first attempt, used for cheap probes.
    pub fn first_timeout(&self) -> Duration {
        self.attempt_timeouts
            .first()
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// schedule is exhausted. `op` receives the timeout for its attempt.
    pub async fn run<F, Fut, T>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let total = self.attempts();
        let mut last_err = ProviderError::Connection(format!("{label}: no attempts configured"));

        for (idx, timeout) in self.attempt_timeouts.iter().enumerate() {
            let attempt = idx + 1;
            debug!(label, attempt, total, timeout_secs = timeout.as_secs(), "provider attempt");
            match op(*timeout).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    warn!(label, attempt, err = %err, "provider call failed, not retryable");
                    return Err(err);
                }
                Err(err) => {
                    warn!(label, attempt, total, err = %err, "provider attempt failed");
                    last_err = err;
                }
            }
            if attempt < total {
                tokio::time::sleep(self.backoff * attempt as u32).await;
            }
        }

        warn!(label, attempts = total, err = %last_err, "provider attempts exhausted");
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeouts: vec![
                Duration::from_secs(60),
                Duration::from_secs(180),
                Duration::from_secs(300),
            ],
            backoff: Duration::from_secs(2),
        }
    }

    /// Defaults match the documented schedule.
    #[test]
    fn default_schedule() {
        assert_eq!(RetryPolicy::default(), policy());
    }

    /// Each attempt gets an escalating timeout and the last error is returned.
    #[tokio::test(start_paused = true)]
    async fn escalates_timeouts_and_returns_last_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();
        let result: Result<(), ProviderError> = policy()
            .run("test", |timeout| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().expect("lock").push(timeout);
                    Err(ProviderError::timeout(timeout))
                }
            })
            .await;

        assert_eq!(result, Err(ProviderError::Timeout { secs: 300 }));
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                Duration::from_secs(60),
                Duration::from_secs(180),
                Duration::from_secs(300)
            ]
        );
        // Linear backoff: 2s after attempt 1, 4s after attempt 2.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    /// Non-retryable errors stop immediately.
    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_error() {
        let calls = Arc::new(Mutex::new(0));
        let result: Result<(), ProviderError> = policy()
            .run("test", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().expect("lock") += 1;
                    Err(ProviderError::Http {
                        status: 401,
                        message: "unauthorized".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(*calls.lock().expect("lock"), 1);
    }

    /// A retryable failure followed by success returns the success.
    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = Arc::new(Mutex::new(0));
        let result = policy()
            .run("test", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    let mut n = calls.lock().expect("lock");
                    *n += 1;
                    if *n == 1 {
                        Err(ProviderError::Connection("refused".into()))
                    } else {
                        Ok("body".to_string())
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("body".to_string()));
        assert_eq!(*calls.lock().expect("lock"), 2);
    }
}
