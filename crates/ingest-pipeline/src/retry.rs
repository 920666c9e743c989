// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic retry with a configurable backoff schedule and stop condition.
//!
//! The same helper drives two very different call sites:
//! - durability writes, which retry forever with exponential backoff until the
//!   write succeeds or the writer is cancelled
//! - shutdown polling, which retries a cheap check on a fixed interval until a
//!   deadline passes
//!
//! Sleeps are always raced against the cancellation token, and never extend past
//! the policy deadline.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::duration_ms;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        #[serde(with = "duration_ms")]
        initial: Duration,
        #[serde(with = "duration_ms")]
        max: Duration,
        multiplier: u32,
    },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let factor = u64::from(multiplier.max(1)).saturating_pow(exponent);
                let millis = u64::try_from(initial.as_millis())
                    .unwrap_or(u64::MAX)
                    .saturating_mul(factor);
                Duration::from_millis(millis).min(max)
            }
        }
    }
}

/// Backoff schedule plus the conditions that end retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Give up after this many attempts. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Give up once this much time has elapsed since the first attempt.
    #[serde(default, with = "duration_ms::option")]
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Retry forever with exponential backoff; used for durability writes.
    pub fn unbounded(initial: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial,
                max,
                multiplier: 2,
            },
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// Retry on a fixed interval until `max_elapsed` has passed.
    pub fn poll_until(interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed { delay: interval },
            max_attempts: None,
            max_elapsed: Some(max_elapsed),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(50), Duration::from_secs(5))
    }
}

/// Why a retried operation ended without success.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error the caller classified as final.
    Permanent(E),
    /// Attempts or time ran out; carries the last error seen.
    Exhausted { last: E, attempts: u32 },
    /// The cancellation token fired while waiting between attempts.
    Cancelled { last: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e)
            | RetryError::Exhausted { last: e, .. }
            | RetryError::Cancelled { last: e, .. } => e,
        }
    }
}

/// Runs `op` until it succeeds, `retryable` rejects an error, the policy is
/// exhausted, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. Metering of failed attempts is left to
/// the operation itself, which sees every error before it is returned here.
pub async fn retry<T, E, Op, Fut, Retryable>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: Op,
    retryable: Retryable,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Retryable: Fn(&E) -> bool,
{
    let started = Instant::now();
    let deadline = policy.max_elapsed.map(|elapsed| started + elapsed);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let last = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(RetryError::Permanent(e)),
            Err(e) => e,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(RetryError::Exhausted {
                last,
                attempts: attempt,
            });
        }

        let mut delay = policy.backoff.delay(attempt);
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(RetryError::Exhausted {
                    last,
                    attempts: attempt,
                });
            }
            delay = delay.min(deadline - now);
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                return Err(RetryError::Cancelled { last, attempts: attempt });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 2,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_delay() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay(1), backoff.delay(99));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::unbounded(Duration::from_millis(1), Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let result: Result<u32, RetryError<&str>> = retry(
            &policy,
            &cancel,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err("transient")
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.ok(), Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = retry(
            &policy,
            &cancel,
            |_| async { Err("closed") },
            |e| *e != "closed",
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent("closed"))));
    }

    #[tokio::test]
    async fn test_deadline_bounds_total_wait() {
        let policy = RetryPolicy::poll_until(Duration::from_millis(40), Duration::from_millis(150));
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();

        let result: Result<(), RetryError<&str>> =
            retry(&policy, &cancel, |_| async { Err("not yet") }, |_| true).await;

        let elapsed = started.elapsed();
        assert!(matches!(result, Err(RetryError::Exhausted { .. })));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let policy = RetryPolicy {
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
            max_attempts: Some(3),
            max_elapsed: None,
        };
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> =
            retry(&policy, &cancel, |_| async { Err("nope") }, |_| true).await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<&str>> = tokio::time::timeout(
            Duration::from_secs(2),
            retry(&policy, &cancel, |_| async { Err("down") }, |_| true),
        )
        .await
        .expect("retry should observe cancellation");

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
