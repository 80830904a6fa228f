use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Result of a single check.
pub enum Attempt<T> {
    Ready(T),
    /// Not there yet; try again if the budget allows.
    Retry(anyhow::Error),
    /// Stop immediately.
    Fail(anyhow::Error),
}

/// Final result of polling with a [`RetryPolicy`].
#[derive(Debug)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut {
        attempts: u32,
        last_error: Option<anyhow::Error>,
    },
    Error(anyhow::Error),
}

/// Polls `check` until it is ready, fails, or the attempt budget runs out.
///
/// A policy with zero attempts is treated as one attempt.
pub async fn wait_until_ready<T, CheckFn, CheckFut>(
    policy: RetryPolicy,
    check: CheckFn,
) -> WaitOutcome<T>
where
    CheckFn: FnMut(u32) -> CheckFut,
    CheckFut: Future<Output = Attempt<T>>,
{
    wait_until_ready_with_sleep(policy, check, tokio::time::sleep).await
}

/// Same as [`wait_until_ready`] with injectable sleep logic.
pub async fn wait_until_ready_with_sleep<T, CheckFn, CheckFut, SleepFn, SleepFut>(
    policy: RetryPolicy,
    mut check: CheckFn,
    mut sleep_fn: SleepFn,
) -> WaitOutcome<T>
where
    CheckFn: FnMut(u32) -> CheckFut,
    CheckFut: Future<Output = Attempt<T>>,
    SleepFn: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match check(attempt).await {
            Attempt::Ready(value) => return WaitOutcome::Ready(value),
            Attempt::Fail(err) => return WaitOutcome::Error(err),
            Attempt::Retry(err) => {
                debug!(
                    "Attempt {attempt}/{attempts} not ready (remaining={}): {err}",
                    attempts - attempt
                );
                last_error = Some(err);
                if attempt < attempts {
                    sleep_fn(policy.delay).await;
                }
            }
        }
    }
    WaitOutcome::TimedOut {
        attempts,
        last_error,
    }
}
