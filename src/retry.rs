//! Bounded exponential-backoff retry.
//!
//! Wraps a re-executable attempt factory: the body is re-created and
//! re-run on each failure, so any side effects inside it repeat. The
//! caller owns idempotency.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry configuration: delay bounds and an attempt cap.
///
/// Retries are sequential within the calling task; the delay doubles
/// per attempt from `min_delay` and is clamped to `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Passed to the after-attempt hook on every failure.
pub struct Attempt<'a, E> {
    /// 1-based attempt number.
    pub number: u32,
    pub max_attempts: u32,
    /// Delay before the next attempt; `None` when no retry follows.
    pub next_delay: Option<Duration>,
    pub error: &'a E,
}

impl RetryPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs `body` with retries. All errors are retryable and no hook
    /// fires.
    pub async fn run<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(body, |_| false, |_| {}).await
    }

    /// Runs `body` with retries, a give-up predicate, and an
    /// after-attempt hook.
    ///
    /// An error matching `give_up` propagates immediately without
    /// retrying. Exhausting `max_attempts` returns the final error
    /// unchanged; retries are never silently swallowed. `after_attempt`
    /// fires after every failed attempt, including the last.
    pub async fn run_with<T, E, F, Fut, G, H>(
        &self,
        mut body: F,
        give_up: G,
        mut after_attempt: H,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: Fn(&E) -> bool,
        H: FnMut(&Attempt<'_, E>),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match body().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let terminal = give_up(&error) || attempt >= max_attempts;
                    let next_delay = (!terminal).then(|| self.backoff(attempt));
                    after_attempt(&Attempt {
                        number: attempt,
                        max_attempts,
                        next_delay,
                        error: &error,
                    });

                    let Some(delay) = next_delay else {
                        return Err(error);
                    };
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Delay after the given 1-based failed attempt: doubles from
    /// `min_delay`, clamped to `max_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.min_delay
            .saturating_mul(factor)
            .clamp(self.min_delay, self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ProducerError;

    #[test]
    fn backoff_doubles_and_clamps() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            5,
        );
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(4), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_runs_body_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let body_calls = calls.clone();
        let hooks = hook_calls.clone();
        let result: Result<(), ProducerError> = policy
            .run_with(
                move || {
                    let body_calls = body_calls.clone();
                    async move {
                        body_calls.fetch_add(1, Ordering::SeqCst);
                        Err(ProducerError::Rejected("bad request".to_string()))
                    }
                },
                ProducerError::is_terminal,
                move |_attempt| {
                    hooks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert!(matches!(result, Err(ProducerError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_hooks_twice() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let body_calls = calls.clone();
        let hooks = hook_calls.clone();
        let result: Result<&str, ProducerError> = policy
            .run_with(
                move || {
                    let n = body_calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ProducerError::Request("connection reset".to_string()))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                ProducerError::is_terminal,
                move |attempt| {
                    assert!(attempt.next_delay.is_some());
                    hooks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_the_final_error() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 4);
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::new(AtomicU32::new(0));

        let body_calls = calls.clone();
        let hooks = hook_calls.clone();
        let result: Result<(), ProducerError> = policy
            .run_with(
                move || {
                    let n = body_calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(ProducerError::Request(format!("attempt {}", n + 1))) }
                },
                |_| false,
                move |attempt| {
                    if attempt.number == attempt.max_attempts {
                        assert!(attempt.next_delay.is_none());
                    }
                    hooks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        match result {
            Err(ProducerError::Request(message)) => assert_eq!(message, "attempt 4"),
            other => panic!("expected request error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_skips_hook_and_sleep() {
        let policy = RetryPolicy::default();
        let result: Result<u32, ProducerError> = policy.run(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
