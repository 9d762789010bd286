use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::clock::Clock;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CUMULATIVE_DELAY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySetting {
    /// Delay before the first retry. Doubled after every sleep.
    pub initial_delay: Duration,
    /// Soft ceiling on the total time spent sleeping between attempts.
    /// It is checked before each sleep, so the final sleep may cross it.
    pub max_cumulative_delay: Duration,
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_cumulative_delay: DEFAULT_MAX_CUMULATIVE_DELAY,
        }
    }
}

/// Backoff bookkeeping for one logical call, including all of its retries.
///
/// Iterating yields the delay to sleep before the next attempt and records it
/// as spent. It stops once the cumulative delay already spent is above the
/// ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: usize,
    pub cumulative_delay: Duration,
    pub next_delay: Duration,
    ceiling: Duration,
}

impl RetryState {
    pub fn new(setting: &RetrySetting) -> Self {
        Self {
            attempt: 0,
            cumulative_delay: Duration::ZERO,
            next_delay: setting.initial_delay,
            ceiling: setting.max_cumulative_delay,
        }
    }
}

impl Iterator for RetryState {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.cumulative_delay > self.ceiling {
            return None;
        }
        let delay = self.next_delay;
        self.cumulative_delay = self.cumulative_delay.saturating_add(delay);
        self.next_delay = delay.checked_mul(2).unwrap_or(Duration::MAX);
        Some(delay)
    }
}

pub trait Predicate<E> {
    fn should_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Predicate<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn should_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate rejected the error; it is returned as-is.
    Fatal(E),
    /// Every attempt failed with a retryable error and the backoff budget is spent.
    Exhausted {
        last: E,
        attempts: usize,
        cumulative_delay: Duration,
    },
}

/// Runs `f` until it succeeds, fails with an error the predicate does not
/// accept, or the backoff budget is spent.
///
/// `f` receives the 1-based attempt number.
pub async fn invoke<R, E, A, P>(
    setting: &RetrySetting,
    clock: &dyn Clock,
    mut predicate: P,
    mut f: impl FnMut(usize) -> A,
) -> Result<R, RetryError<E>>
where
    E: Display,
    A: Future<Output = Result<R, E>>,
    P: Predicate<E>,
{
    let mut state = RetryState::new(setting);
    loop {
        state.attempt += 1;
        let error = match f(state.attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !predicate.should_retry(&error) {
            return Err(RetryError::Fatal(error));
        }
        match state.next() {
            Some(delay) => {
                tracing::warn!(
                    attempt = state.attempt,
                    delay_secs = delay.as_secs_f64(),
                    cumulative_secs = state.cumulative_delay.as_secs_f64(),
                    "{error}. Retrying after {} seconds...",
                    delay.as_secs_f64()
                );
                clock.sleep(delay).await;
            }
            None => {
                tracing::error!(
                    attempt = state.attempt,
                    cumulative_secs = state.cumulative_delay.as_secs_f64(),
                    "{error}. Retrying stopped."
                );
                return Err(RetryError::Exhausted {
                    last: error,
                    attempts: state.attempt,
                    cumulative_delay: state.cumulative_delay,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::retry::{invoke, RetryError, RetrySetting, RetryState};

    #[test]
    fn backoff_doubles_until_ceiling_is_crossed() {
        let delays: Vec<u64> = RetryState::new(&RetrySetting::default()).map(|d| d.as_secs()).collect();
        // 5+10+...+160 = 315 <= 600, so the 320s sleep is still allowed.
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320]);
        assert_eq!(delays.iter().sum::<u64>(), 635);
    }

    #[test]
    fn ceiling_is_inclusive() {
        let setting = RetrySetting {
            initial_delay: Duration::from_secs(5),
            max_cumulative_delay: Duration::from_secs(15),
        };
        // cumulative 15 <= 15 still permits the 20s sleep
        let delays: Vec<u64> = RetryState::new(&setting).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20]);
    }

    #[tokio::test]
    async fn succeeds_after_retries() {
        let clock = ManualClock::new();
        let calls = AtomicUsize::new(0);
        let result: Result<&str, RetryError<String>> =
            invoke(&RetrySetting::default(), &clock, |_: &String| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5), Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let clock = ManualClock::new();
        let result: Result<(), RetryError<String>> =
            invoke(&RetrySetting::default(), &clock, |_: &String| false, |_| async {
                Err("bad request".to_string())
            })
            .await;
        match result {
            Err(RetryError::Fatal(e)) => assert_eq!(e, "bad request"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn exhausted_reports_spent_delay() {
        let clock = ManualClock::new();
        let result: Result<(), RetryError<String>> =
            invoke(&RetrySetting::default(), &clock, |_: &String| true, |_| async {
                Err("unavailable".to_string())
            })
            .await;
        match result {
            Err(RetryError::Exhausted {
                attempts,
                cumulative_delay,
                ..
            }) => {
                assert_eq!(attempts, 8);
                assert_eq!(cumulative_delay, Duration::from_secs(635));
                assert!(cumulative_delay > RetrySetting::default().max_cumulative_delay);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(clock.total_slept(), Duration::from_secs(635));
    }
}
