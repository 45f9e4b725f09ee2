use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Bounded retry with a fixed delay, configured per external collaborator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,
}

fn default_max_attempts() -> usize {
    3
}
fn default_delay_seconds() -> u64 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: default_delay_seconds(),
        }
    }
}

/// Outcome of one attempt. Only `Transient` failures are retried.
#[derive(Debug)]
pub enum RetryError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl From<anyhow::Error> for RetryError {
    fn from(e: anyhow::Error) -> Self {
        RetryError::Permanent(e)
    }
}

impl From<reqwest::Error> for RetryError {
    fn from(e: reqwest::Error) -> Self {
        RetryError::Permanent(e.into())
    }
}

/// Maps an unsuccessful HTTP status to a retry decision. Overload and
/// warm-up responses are transient, everything else is final.
pub fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> RetryError {
    let err = anyhow!("{} API error ({}): {}", service, status, body);
    match status.as_u16() {
        429 | 502 | 503 | 504 => RetryError::Transient(err),
        _ => RetryError::Permanent(err),
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay_seconds: u64) -> Self {
        Self {
            max_attempts,
            delay_seconds,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RetryError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = anyhow!("{} was never attempted", label);

        for n in 0..max_attempts {
            if n > 0 {
                warn!("{} not ready (attempt {}/{}), retrying...", label, n + 1, max_attempts);
                sleep(self.delay()).await;
            }

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(RetryError::Permanent(e)) => return Err(e),
                Err(RetryError::Transient(e)) => {
                    warn!("{} transient failure: {:#}", label, e);
                    last_error = e;
                }
            }
        }

        Err(last_error.context(format!("{} still failing after {} attempts", label, max_attempts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() -> Result<()> {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, 0);

        let value = policy
            .run("model", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RetryError::Transient(anyhow!("loading")))
                } else {
                    Ok(42)
                }
            })
            .await?;

        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, 0);

        let result: Result<()> = policy
            .run("model", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RetryError::Transient(anyhow!("loading")))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, 0);

        let result: Result<()> = policy
            .run("model", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RetryError::Permanent(anyhow!("bad key")))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "bad key");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(status_error("x", StatusCode::SERVICE_UNAVAILABLE, ""), RetryError::Transient(_)));
        assert!(matches!(status_error("x", StatusCode::TOO_MANY_REQUESTS, ""), RetryError::Transient(_)));
        assert!(matches!(status_error("x", StatusCode::UNAUTHORIZED, ""), RetryError::Permanent(_)));
    }
}
