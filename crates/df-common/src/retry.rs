//! Retry-with-backoff executor for unreliable operations.
//!
//! Used anywhere the fabric calls something that can fail transiently:
//! broker publishes, webhook deliveries, coordination-backend calls.
//! Exhaustion is signalled by returning `None`, never by propagating the
//! error out of the invoker itself; callers that need the final error
//! observe it through the `on_failure` callback.

use std::future::Future;
use std::time::Duration;

/// Retry policy: attempt count and inter-attempt delay shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Clamped to at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// When set, the delay before retry `n` is `base_delay * n`; otherwise
    /// every delay is `base_delay`.
    pub backoff: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: false,
        }
    }

    pub fn backoff(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: true,
        }
    }

    /// Attempts are numbered from 1; this is the delay after attempt
    /// `attempt` fails.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff {
            self.base_delay * attempt
        } else {
            self.base_delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backoff(3, Duration::from_millis(500))
    }
}

/// Executes an operation under a [`RetryPolicy`].
///
/// Attempts are strictly sequential; a single `run` never invokes the
/// operation concurrently with itself.
pub struct RetryInvoker;

impl RetryInvoker {
    /// Run an async operation, returning `Some(value)` on the first success
    /// or `None` once attempts are exhausted.
    pub async fn run<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Self::run_with(policy, op, |_attempt, _err: &E| {}, |_err: &E| {}).await
    }

    /// Like [`RetryInvoker::run`], with failure callbacks.
    ///
    /// `on_attempt_failure(attempt, err)` fires after every non-final failed
    /// attempt (so exactly `max_attempts - 1` times for an always-failing
    /// operation); `on_failure(err)` fires exactly once when attempts are
    /// exhausted.
    pub async fn run_with<T, E, F, Fut, A, X>(
        policy: RetryPolicy,
        mut op: F,
        mut on_attempt_failure: A,
        mut on_failure: X,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: FnMut(u32, &E),
        X: FnMut(&E),
    {
        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(err) => {
                    if attempt < max_attempts {
                        on_attempt_failure(attempt, &err);
                        let delay = policy.delay_for(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    } else {
                        on_failure(&err);
                    }
                }
            }
        }
        None
    }

    /// Synchronous form for callers outside the async runtime.
    pub fn run_sync<T, E, F>(policy: RetryPolicy, mut op: F) -> Option<T>
    where
        F: FnMut() -> Result<T, E>,
    {
        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Ok(value) = op() {
                return Some(value);
            }
            if attempt < max_attempts {
                let delay = policy.delay_for(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_callbacks() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = RetryInvoker::run(
            RetryPolicy::fixed(5, Duration::ZERO),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>("done")
                }
            },
        )
        .await;

        assert_eq!(result, Some("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_op_runs_exactly_k_times_with_callback_counts() {
        let k = 4u32;
        let attempts = Arc::new(AtomicU32::new(0));
        let attempt_failures = Arc::new(AtomicU32::new(0));
        let final_failures = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Option<()> = RetryInvoker::run_with(
            RetryPolicy::fixed(k, Duration::ZERO),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            },
            {
                let attempt_failures = attempt_failures.clone();
                move |_attempt, _err| {
                    attempt_failures.fetch_add(1, Ordering::SeqCst);
                }
            },
            {
                let final_failures = final_failures.clone();
                move |_err| {
                    final_failures.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), k);
        assert_eq!(attempt_failures.load(Ordering::SeqCst), k - 1);
        assert_eq!(final_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_midway_and_stops_retrying() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = RetryInvoker::run(
            RetryPolicy::fixed(10, Duration::ZERO),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(99)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Some(99));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn max_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);

        let mut calls = 0;
        let result: Option<()> = RetryInvoker::run_sync(policy, || {
            calls += 1;
            Err::<(), _>("always")
        });
        assert!(result.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_delay_grows_linearly_with_attempt() {
        let policy = RetryPolicy::backoff(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(5, Duration::from_millis(100));
        assert_eq!(fixed.delay_for(3), Duration::from_millis(100));
    }
}
