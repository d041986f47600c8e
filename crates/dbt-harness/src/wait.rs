//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Deadline-bounded sleep-poll loop."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{HarnessError, Result};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Something [`wait_until`] can poll.
pub trait Condition {
    /// Re-evaluate the condition against the current state of the world.
    fn check(&mut self) -> bool;

    /// Human readable label used in timeout errors.
    fn describe(&self) -> String {
        "condition".to_owned()
    }
}

impl<F> Condition for F
where
    F: FnMut() -> bool,
{
    fn check(&mut self) -> bool {
        self()
    }
}

/// Block the calling thread until `condition` holds or `timeout` elapses.
///
/// The condition is checked before the first sleep, so one that already
/// holds returns without sleeping. Sleeps never overshoot the deadline.
/// Returns the time spent waiting.
pub fn wait_until<C: Condition>(
    mut condition: C,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Duration> {
    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let started = Instant::now();
    // `None` when the timeout is too large to represent: wait indefinitely.
    let deadline = started.checked_add(timeout);
    let mut polls = 0u64;

    loop {
        polls += 1;
        if condition.check() {
            let waited = started.elapsed();
            trace!(polls, waited_ms = waited.as_millis() as u64, "condition satisfied");
            return Ok(waited);
        }
        let pause = match remaining(deadline) {
            Some(left) if left.is_zero() => {
                return Err(HarnessError::Timeout {
                    condition: condition.describe(),
                    timeout,
                });
            }
            Some(left) => poll_interval.min(left),
            None => poll_interval,
        };
        thread::sleep(pause);
    }
}

/// Time left until `deadline`; `None` for an unbounded wait.
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_true_returns_without_sleeping() {
        let waited = wait_until(|| true, Duration::from_secs(5), Duration::from_secs(1)).unwrap();
        assert!(waited < Duration::from_millis(100), "waited {waited:?}");
    }

    #[test]
    fn always_false_times_out_within_one_poll_interval() {
        let timeout = Duration::from_millis(300);
        let poll = Duration::from_millis(50);
        let started = Instant::now();
        let err = wait_until(|| false, timeout, poll).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, HarnessError::Timeout { timeout: t, .. } if t == timeout));
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(
            elapsed < timeout + poll + Duration::from_millis(100),
            "overshot deadline: {elapsed:?}"
        );
    }

    #[test]
    fn becomes_true_after_some_polls() {
        let mut calls = 0;
        wait_until(
            || {
                calls += 1;
                calls >= 3
            },
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_timeout_still_checks_once() {
        assert!(wait_until(|| true, Duration::ZERO, Duration::from_millis(10)).is_ok());
        assert!(wait_until(|| false, Duration::ZERO, Duration::from_millis(10))
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let waited = wait_until(|| true, Duration::MAX, Duration::from_millis(10)).unwrap();
        assert!(waited < Duration::from_secs(1));

        let mut calls = 0;
        wait_until(
            || {
                calls += 1;
                calls >= 2
            },
            Duration::MAX,
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(calls, 2);
    }

    struct Labelled;

    impl Condition for Labelled {
        fn check(&mut self) -> bool {
            false
        }

        fn describe(&self) -> String {
            "the moon to rise".to_owned()
        }
    }

    #[test]
    fn timeout_message_uses_condition_label() {
        let err = wait_until(Labelled, Duration::from_millis(20), Duration::from_millis(5))
            .unwrap_err();
        assert!(err.to_string().contains("the moon to rise"));
    }
}
