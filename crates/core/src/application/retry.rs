// Retry over time
// Bounded backoff around operations failing with recoverable errors
use crate::application::constants::{
    DEFAULT_INTERVAL_MAX, DEFAULT_INTERVAL_START, DEFAULT_INTERVAL_STEP,
};
use crate::error::{BrokerError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again
    Retry(Duration),
    /// Stop and surface the last error
    GiveUp,
}

/// Backoff schedule plus its bounds
///
/// Sleeps grow linearly: `interval_start`, `interval_start + interval_step`, ...
/// capped at `interval_max`. Retrying stops after `max_retries` retries or
/// when the next sleep would pass `deadline` (measured from the first attempt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    pub interval_start: Duration,
    pub interval_step: Duration,
    pub interval_max: Duration,
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            interval_start: DEFAULT_INTERVAL_START,
            interval_step: DEFAULT_INTERVAL_STEP,
            interval_max: DEFAULT_INTERVAL_MAX,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Default backoff with an optional retry bound
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_intervals(mut self, start: Duration, step: Duration, max: Duration) -> Self {
        self.interval_start = start;
        self.interval_step = step;
        self.interval_max = max;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sleep before retry number `retries + 1`
    pub fn interval(&self, retries: u32) -> Duration {
        self.interval_step
            .checked_mul(retries)
            .and_then(|grown| self.interval_start.checked_add(grown))
            .unwrap_or(self.interval_max)
            .min(self.interval_max)
    }

    /// Decide what follows a failed attempt
    ///
    /// # Arguments
    /// * `retries` - Retries already performed (0 after the first failure)
    /// * `elapsed` - Time since the first attempt started
    pub fn should_retry(&self, retries: u32, elapsed: Duration) -> RetryDecision {
        if let Some(max_retries) = self.max_retries {
            if retries >= max_retries {
                return RetryDecision::GiveUp;
            }
        }

        let sleep = self.interval(retries);
        if let Some(deadline) = self.deadline {
            if elapsed + sleep > deadline {
                return RetryDecision::GiveUp;
            }
        }

        RetryDecision::Retry(sleep)
    }
}

/// Recoverable-error predicate
pub type RecoverablePredicate = fn(&BrokerError) -> bool;

/// Errors retried by `retry_over_time`, checked in order:
/// lost connections first, then recoverable channel errors
pub const RECOVERABLE_ERRORS: [RecoverablePredicate; 2] = [
    BrokerError::is_recoverable_connection,
    BrokerError::is_recoverable_channel,
];

pub fn is_recoverable(err: &BrokerError) -> bool {
    RECOVERABLE_ERRORS.iter().any(|predicate| predicate(err))
}

/// Run `operation` until it succeeds, fails with a non-recoverable error,
/// or the policy gives up. `errback` observes every retried failure together
/// with the sleep about to happen.
pub async fn retry_over_time<T, F, Fut, E>(
    policy: &RetryPolicy,
    mut operation: F,
    mut errback: E,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    E: FnMut(&BrokerError, Duration),
{
    let started = Instant::now();
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_recoverable(&err) {
            return Err(err);
        }

        match policy.should_retry(retries, started.elapsed()) {
            RetryDecision::Retry(sleep) => {
                errback(&err, sleep);
                tokio::time::sleep(sleep).await;
                retries += 1;
            }
            RetryDecision::GiveUp => {
                warn!(
                    error = %err,
                    retries = retries,
                    "Giving up after recoverable errors"
                );
                return Err(err);
            }
        }
    }
}

/// Default errback: log and keep going
pub fn log_recoverable_error(err: &BrokerError, sleep: Duration) {
    warn!(
        error = %err,
        sleep_ms = sleep.as_millis() as u64,
        "Recoverable error, retrying"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lost() -> BrokerError {
        BrokerError::Connection("connection reset".to_string())
    }

    #[test]
    fn test_interval_grows_then_caps() {
        let policy = RetryPolicy::default();
        let schedule: Vec<u64> = (0..18).map(|n| policy.interval(n).as_secs()).collect();

        assert_eq!(&schedule[..4], &[2, 4, 6, 8]);
        assert_eq!(schedule[14], 30);
        assert_eq!(schedule[17], 30);
    }

    #[test]
    fn test_should_retry_respects_max_retries() {
        let policy = RetryPolicy::new(Some(2));
        assert_eq!(
            policy.should_retry(0, Duration::ZERO),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.should_retry(1, Duration::ZERO),
            RetryDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(policy.should_retry(2, Duration::ZERO), RetryDecision::GiveUp);
    }

    #[test]
    fn test_should_retry_respects_deadline() {
        let policy = RetryPolicy::default().with_deadline(Duration::from_secs(5));
        assert_eq!(
            policy.should_retry(0, Duration::from_secs(1)),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.should_retry(1, Duration::from_secs(2)),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let mut observed = Vec::new();

        let result = retry_over_time(
            &RetryPolicy::default(),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(lost())
                } else {
                    Ok("declared")
                }
            },
            |_, sleep| observed.push(sleep),
        )
        .await;

        assert_eq!(result.unwrap(), "declared");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = retry_over_time(
            &RetryPolicy::new(Some(2)),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(lost())
            },
            log_recoverable_error,
        )
        .await;

        assert_eq!(result.unwrap_err(), lost());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = retry_over_time(
            &RetryPolicy::new(Some(0)),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(lost())
            },
            |_, _| panic!("no retry expected"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = retry_over_time(
            &RetryPolicy::default(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Timeout("publish confirmation".to_string()))
            },
            |_, _| panic!("no retry expected"),
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
