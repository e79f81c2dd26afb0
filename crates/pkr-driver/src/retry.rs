//! Bounded retry of collaborator calls

use pkr_core::Meta;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{DriverError, Result};

/// Meta key holding the policy
pub const RETRY_KEY: &str = "driver.retry";

/// `driver.retry` settings
///
/// ```yaml
/// driver:
///   retry:
///     attempts: 5
///     delay: 2s
///     backoff: 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of tries, the first one included
    pub attempts: u32,

    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Delay multiplier between tries; 1.0 keeps it fixed
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A single try
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn from_meta(meta: &Meta) -> Result<Self> {
        match meta.get(RETRY_KEY) {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| DriverError::InvalidConfig(format!("invalid {RETRY_KEY}: {e}"))),
        }
    }

    /// Wait before try `attempt + 1`, `attempt` counting from 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(0.0).powi(attempt.saturating_sub(1) as i32);
        self.delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or tries run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        attempts,
                        delay = ?delay,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
            backoff: 1.0,
        }
    }

    fn failure(stderr: &str) -> DriverError {
        DriverError::Collaborator {
            tool: "kubectl".to_string(),
            args: vec!["apply".to_string()],
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_policy_from_meta() {
        let meta = Meta::from(json!({"driver": {"retry": {"attempts": 5, "delay": "250ms"}}}));
        let policy = RetryPolicy::from_meta(&meta).unwrap();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert_eq!(policy.backoff, 1.0);

        assert_eq!(RetryPolicy::from_meta(&Meta::new()).unwrap(), RetryPolicy::default());

        let bad = Meta::from(json!({"driver": {"retry": {"delay": "soon"}}}));
        assert!(matches!(
            RetryPolicy::from_meta(&bad),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_delay_backoff() {
        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_for(1), Duration::from_secs(1));
        assert_eq!(fixed.delay_for(3), Duration::from_secs(1));

        let doubling = RetryPolicy {
            backoff: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(doubling.delay_for(1), Duration::from_secs(1));
        assert_eq!(doubling.delay_for(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = quick(3)
            .run("push", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(failure("connection reset by peer"))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = quick(2)
            .run("pull", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure("504 Gateway Timeout"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = quick(5)
            .run("login", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure("unauthorized: authentication required"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
