//! Bounded, cancellable polling.
//!
//! The systems the orchestrator watches only expose polling APIs. Every wait
//! in the workspace goes through [`poll_until`] so that each loop has a hard
//! attempt budget and an overall scenario deadline can abort nested waits
//! through a shared [`CancellationToken`].

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Number of probes, including the first one which runs immediately.
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self::new(self.interval, max_attempts)
    }

    /// Upper bound of the time spent sleeping between probes.
    pub fn ceiling(&self) -> Duration {
        self.interval
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } |
            PollOutcome::Exhausted { attempts } |
            PollOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Runs `probe` until it yields `Some`, the attempt budget is spent or
/// `cancel` fires. The first probe runs immediately, subsequent probes are
/// spaced by `policy.interval`. Probe errors abort the loop.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut ticker = time::interval(policy.interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempts, "poll cancelled");
                return Ok(PollOutcome::Cancelled { attempts });
            }
            _ = ticker.tick() => {}
        }
        attempts += 1;
        if let Some(value) = probe(attempts).await? {
            return Ok(PollOutcome::Ready { value, attempts });
        }
        if attempts >= max_attempts {
            return Ok(PollOutcome::Exhausted { attempts });
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

/// Cancels `token` once `after` has elapsed.
pub fn cancel_after(token: &CancellationToken, after: Duration) -> JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = time::sleep(after) => token.cancel(),
        }
    })
}
