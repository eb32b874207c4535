// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Backoff and bounded retry helpers, used for the default per-step backoff
//! curve and the bounded (default 5) undo-retry loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// The shape of a backoff curve, later mapped to a growth multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
}

/// A backoff curve: `initial_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`. `BackoffStrategy` maps to a multiplier of `2.0` for
/// `Exponential` and `1.0` for `Linear`/`Constant`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn from_strategy(strategy: BackoffStrategy, initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        let multiplier = match strategy {
            BackoffStrategy::Exponential => 2.0,
            BackoffStrategy::Linear => 1.0,
            BackoffStrategy::Constant => 1.0,
        };
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before the given 1-indexed attempt, with +/-10% jitter so many
    /// concurrently-backing-off steps don't all wake in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

/// Drives a fallible async operation through a [`RetryPolicy`], sleeping
/// between attempts. Used for the bounded undo-retry loop; step-level
/// `Retry`/`RetryWith` outcomes are instead driven by the executor's ready
/// loop so other steps can keep progressing during the backoff window.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0, Duration::from_secs(10));
        let d1 = policy.delay_for(1).as_secs_f64();
        let d3 = policy.delay_for(3).as_secs_f64();
        assert!(d3 > d1 * 3.0); // allow for jitter but expect clear growth
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(20, Duration::from_millis(100), 2.0, Duration::from_millis(500));
        let late = policy.delay_for(20);
        assert!(late.as_secs_f64() <= 0.55);
    }

    #[tokio::test]
    async fn retry_executor_stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 1.0, Duration::from_millis(5));
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_executor_succeeds_on_later_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 1.0, Duration::from_millis(5));
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }
}
