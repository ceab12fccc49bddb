//! Bounded exponential backoff around read-modify-write cycles.
//!
//! Both the cluster version override edit and the deployment patch race an autonomous reconciler
//! that writes the same objects. Every write is conditioned on the resource version that was read,
//! so a lost race surfaces as a conflict error. [`on_conflict`] re-runs the whole cycle (read,
//! mutate, write) until it goes through or the [`Backoff`] budget is spent.
//!
//! ```no_run
//! # use operator_dev::retry::{self, Backoff, Conflict};
//! # #[derive(Debug)] struct Error;
//! # impl Conflict for Error { fn is_conflict(&self) -> bool { false } }
//! # async fn read_modify_write() -> Result<(), Error> { Ok(()) }
//! # async fn run() -> Result<(), Error> {
//! retry::on_conflict(&Backoff::default(), || read_modify_write()).await?;
//! # Ok(())
//! # }
//! ```
use std::{future::Future, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff as _};
use tracing::{debug, info};

/// Implemented by errors that can signal an optimistic-concurrency conflict.
pub trait Conflict {
    /// Returns `true` if the remote store rejected a write because the object changed after it
    /// was read.
    fn is_conflict(&self) -> bool;
}

/// Retry policy for conflicting writes.
///
/// The defaults mirror the backoff Kubernetes clients conventionally use for conflict retries,
/// with an additional upper bound on a single delay.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after every attempt.
    pub factor: f64,

    /// Every delay is randomized within `delay * (1 ± jitter)`. `0.0` disables jitter.
    pub jitter: f64,

    /// Maximum number of attempts, including the first one.
    pub steps: u32,

    /// Upper bound for a single un-randomized delay.
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            steps: 4,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// A fresh delay schedule. The attempt budget is enforced by [`retry`], not by elapsed time.
    fn exponential(&self) -> ExponentialBackoff {
        let initial_interval = self.initial_delay.min(self.max_delay);

        ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            randomization_factor: self.jitter,
            multiplier: self.factor,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or the attempts
/// allowed by `backoff` are used up. In the last case the error of the final attempt is returned.
///
/// `op` is invoked anew for every attempt, so anything it read during a failed attempt is
/// discarded.
pub async fn retry<T, E, F, Fut, P>(
    backoff: &Backoff,
    mut is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut backoff_strategy = backoff.exponential();
    let mut attempt: u32 = 1;

    loop {
        debug!(attempt, "running attempt");

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            return Err(error);
        }

        let delay = match backoff_strategy.next_backoff() {
            Some(delay) if attempt < backoff.steps => delay,
            _ => {
                debug!(attempt, "retry budget exhausted");
                return Err(error);
            }
        };

        info!(attempt, ?delay, "write conflicted with a concurrent update, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// [`retry`] keyed on [`Conflict::is_conflict`].
pub async fn on_conflict<T, E, F, Fut>(backoff: &Backoff, op: F) -> Result<T, E>
where
    E: Conflict,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry(backoff, E::is_conflict, op).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use backoff::backoff::Backoff as _;
    use rstest::rstest;
    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Conflict,
        Fatal,
    }

    impl Conflict for TestError {
        fn is_conflict(&self) -> bool {
            matches!(self, Self::Conflict)
        }
    }

    fn without_jitter() -> Backoff {
        Backoff {
            jitter: 0.0,
            ..Backoff::default()
        }
    }

    fn schedule(backoff: &Backoff) -> Vec<Duration> {
        let mut strategy = backoff.exponential();
        (1..backoff.steps)
            .filter_map(|_| strategy.next_backoff())
            .collect()
    }

    #[test]
    fn default_schedule() {
        assert_eq!(schedule(&without_jitter()), [
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(250)
        ]);
    }

    #[test]
    fn delays_are_capped() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(1),
            factor: 10.0,
            jitter: 0.0,
            steps: 4,
            max_delay: Duration::from_secs(5),
        };

        assert_eq!(schedule(&backoff), [
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(5)
        ]);
    }

    #[test]
    fn initial_delay_is_capped() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(60),
            jitter: 0.0,
            steps: 2,
            ..Backoff::default()
        };

        assert_eq!(schedule(&backoff), [Duration::from_secs(5)]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(100),
            jitter: 0.5,
            ..Backoff::default()
        };

        for _ in 0..100 {
            let delay = backoff
                .exponential()
                .next_backoff()
                .expect("no elapsed time limit");
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(151));
        }
    }

    #[test]
    fn huge_delays_do_not_overflow() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(u64::MAX / 2),
            factor: 1000.0,
            jitter: 0.9,
            steps: 50,
            max_delay: Duration::from_secs(u64::MAX / 2),
        };

        let delays = schedule(&backoff);
        assert_eq!(delays.len(), 49);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[tokio::test(start_paused = true)]
    async fn succeeds_after_conflicts(#[case] conflicts: usize) {
        let calls = AtomicUsize::new(0);

        let result = on_conflict(&without_jitter(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < conflicts {
                    Err(TestError::Conflict)
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(conflicts));
        assert_eq!(calls.load(Ordering::SeqCst), conflicts + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_the_backoff_schedule() {
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let result = on_conflict(&without_jitter(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move { if call < 2 { Err(TestError::Conflict) } else { Ok(()) } }
        })
        .await;

        assert_eq!(result, Ok(()));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(61));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_conflict() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = on_conflict(&without_jitter(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Conflict) }
        })
        .await;

        assert_eq!(result, Err(TestError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = on_conflict(&without_jitter(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry(
            &without_jitter(),
            |error: &TestError| *error == TestError::Fatal,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
        )
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
