use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSetting {
    /// Time slept between two status checks.
    pub interval: Duration,
    /// Client-side cutoff. The remote operation keeps running when it is hit.
    pub timeout: Option<Duration>,
}

impl Default for PollSetting {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl PollSetting {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// The caller stopped waiting. Says nothing about the remote operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("stopped waiting after {elapsed:?} (timeout {timeout:?})")]
pub struct PollTimeout {
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum PollError<E> {
    Timeout(PollTimeout),
    Operation(E),
}

/// Interval and timeout bookkeeping for one wait loop.
///
/// The clock starts when the poller is created, which is the moment the
/// operation enters the polling state.
#[derive(Debug, Clone)]
pub struct Poller {
    setting: PollSetting,
    clock: Arc<dyn Clock>,
    started_at: Instant,
    ticks: usize,
}

impl Poller {
    pub fn start(setting: PollSetting, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            setting,
            clock,
            started_at,
            ticks: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    /// Number of completed sleeps.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Fails if the timeout has been exceeded, otherwise sleeps one interval.
    /// No network call is made by this method.
    pub async fn tick(&mut self) -> Result<(), PollTimeout> {
        if let Some(timeout) = self.setting.timeout {
            let elapsed = self.elapsed();
            if elapsed > timeout {
                return Err(PollTimeout { elapsed, timeout });
            }
        }
        tracing::debug!(tick = self.ticks + 1, interval = ?self.setting.interval, "waiting");
        self.clock.sleep(self.setting.interval).await;
        self.ticks += 1;
        Ok(())
    }
}

/// Calls `fetch` until `is_done` accepts its result, sleeping the configured
/// interval between calls.
pub async fn poll_until<T, E, A>(
    setting: PollSetting,
    clock: Arc<dyn Clock>,
    mut fetch: impl FnMut() -> A,
    mut is_done: impl FnMut(&T) -> bool,
) -> Result<T, PollError<E>>
where
    A: Future<Output = Result<T, E>>,
{
    let mut poller = Poller::start(setting, clock);
    loop {
        let current = fetch().await.map_err(PollError::Operation)?;
        if is_done(&current) {
            return Ok(current);
        }
        poller.tick().await.map_err(PollError::Timeout)?;
    }
}
