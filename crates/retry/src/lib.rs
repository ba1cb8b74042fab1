//! Exponential backoff for calls against the execution engine and the
//! replicated store.
//!
//! Every attempt reports an [`Outcome`]: only [`Outcome::Retryable`] leads to
//! another attempt. A [`Policy`] either caps the number of attempts, or retries
//! until it succeeds, fails permanently, or its [`CancellationToken`] fires.
//! Cancellation is observed both while an attempt is in flight and while
//! waiting for the next one.

use std::{future::Future, time::Duration};

use rand::Rng as _;
use tandem_telemetry_util::{display_duration, error_field};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound for the un-jittered delay between attempts.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Number of attempts made by [`Policy::bounded`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// The result of a single attempt.
#[derive(Debug)]
pub enum Outcome<T, E> {
    Success(T),
    /// The failure is transient; try again after backing off.
    Retryable(E),
    /// The failure will not go away by retrying; stop immediately.
    Permanent(E),
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    /// Treats every error as transient.
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Retryable(error),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error(transparent)]
    Permanent(E),
    #[error("gave up after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("cancelled while retrying")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Each delay is drawn uniformly from `delay * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
    /// `None` retries until success, a permanent failure, or cancellation.
    pub max_attempts: Option<u32>,
}

impl Policy {
    /// Gives up after [`DEFAULT_MAX_ATTEMPTS`] attempts.
    pub fn bounded() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            ..Self::unbounded()
        }
    }

    pub fn unbounded() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn with_initial_interval(self, initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            ..self
        }
    }

    pub fn with_max_interval(self, max_interval: Duration) -> Self {
        Self {
            max_interval,
            ..self
        }
    }

    /// Disables jitter so that delays are exactly the exponential sequence.
    pub fn without_jitter(self) -> Self {
        Self {
            randomization_factor: 0.0,
            ..self
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            next_interval: self.initial_interval,
            attempts: 1,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::bounded()
    }
}

/// The sequence of delays produced by a [`Policy`].
///
/// Starts out having accounted for the first attempt.
#[derive(Debug)]
pub struct Backoff {
    policy: Policy,
    next_interval: Duration,
    attempts: u32,
}

impl Backoff {
    /// The delay to wait before the next attempt, or `None` if the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            return None;
        }
        self.attempts += 1;

        let delay = jitter(self.next_interval, self.policy.randomization_factor);
        let grown = self.next_interval.as_nanos() as f64 * self.policy.multiplier;
        self.next_interval = Duration::from_nanos(grown as u64).min(self.policy.max_interval);
        Some(delay)
    }

    /// Attempts accounted for so far, including the one the last delay was
    /// handed out for.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = secs * factor.min(1.0);
    Duration::from_secs_f64(rand::rng().random_range((secs - delta)..=(secs + delta)))
}

/// Drives `operation` until it succeeds, fails permanently, exhausts the
/// policy's attempts, or `cancel` fires.
///
/// Every retryable failure is logged at WARN together with the delay until
/// the next attempt. Logging the final failure is left to the caller.
pub async fn retry<T, E, F, Fut>(
    policy: &Policy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, E>>,
    E: std::error::Error + 'static,
{
    let mut backoff = policy.backoff();
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation() => outcome,
        };

        let error = match outcome {
            Outcome::Success(value) => return Ok(value),
            Outcome::Permanent(error) => return Err(RetryError::Permanent(error)),
            Outcome::Retryable(error) => error,
        };

        let attempts = backoff.attempts();
        let Some(delay) = backoff.next_delay() else {
            return Err(RetryError::Exhausted {
                attempts,
                last: error,
            });
        };
        warn!(
            attempt = attempts,
            retry_after = %display_duration(delay),
            error = error_field(&error),
            "attempt failed; retrying",
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `false` if cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{Outcome, Policy, RetryError, retry};

    #[derive(Debug, thiserror::Error)]
    #[error("flaky call #{0}")]
    struct Flaky(u32);

    #[test]
    fn delays_grow_geometrically_and_cap() {
        let policy = Policy::unbounded()
            .without_jitter()
            .with_max_interval(Duration::from_millis(500));
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            [200, 300, 450, 500, 500].map(Duration::from_millis).to_vec(),
        );
    }

    #[test]
    fn jittered_delays_stay_within_the_randomization_window() {
        let mut backoff = Policy::bounded().backoff();
        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(300));
    }

    #[test]
    fn bounded_backoff_hands_out_one_delay_less_than_attempts() {
        let mut backoff = Policy::bounded().with_max_attempts(3).backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let mut calls = 0;
        let value = retry(&Policy::bounded(), &CancellationToken::new(), || {
            calls += 1;
            let call = calls;
            async move {
                if call < 4 {
                    Outcome::Retryable(Flaky(call))
                } else {
                    Outcome::Success(call)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_reports_exhaustion_with_last_error() {
        let mut calls = 0;
        let error = retry(
            &Policy::bounded().with_max_attempts(5),
            &CancellationToken::new(),
            || {
                calls += 1;
                let call = calls;
                async move { Outcome::<(), _>::Retryable(Flaky(call)) }
            },
        )
        .await
        .unwrap_err();

        let RetryError::Exhausted { attempts, last } = error else {
            panic!("expected exhaustion, got {error:?}");
        };
        assert_eq!(attempts, 5);
        assert_eq!(last.0, 5);
        assert_eq!(calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_immediately() {
        let mut calls = 0;
        let error = retry(&Policy::unbounded(), &CancellationToken::new(), || {
            calls += 1;
            let call = calls;
            async move { Outcome::<(), _>::Permanent(Flaky(call)) }
        })
        .await
        .unwrap_err();

        assert!(matches!(error, RetryError::Permanent(Flaky(1))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_policy_outlasts_the_bounded_budget() {
        let mut calls = 0;
        let value = retry(&Policy::unbounded(), &CancellationToken::new(), || {
            calls += 1;
            let call = calls;
            async move {
                if call < 25 {
                    Outcome::Retryable(Flaky(call))
                } else {
                    Outcome::Success(call)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let error = retry(&Policy::unbounded(), &cancel, || async {
            Outcome::<(), _>::Retryable(Flaky(0))
        })
        .await
        .unwrap_err();

        assert!(error.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_an_attempt_in_flight() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = retry(&Policy::unbounded(), &cancel, || async {
            std::future::pending::<Outcome<(), Flaky>>().await
        })
        .await
        .unwrap_err();
        assert!(error.is_cancelled());
    }
}
