//! How long a blocking call may wait, and the poll loop plumbing shared by
//! the lock, the queue and result waiting.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Waiting behaviour of a blocking coordination call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Fail immediately if the call cannot complete.
    NonBlocking,
    /// Poll until the duration elapses.
    Timeout(Duration),
    /// Poll until success or cancellation.
    #[default]
    Forever,
}

impl WaitPolicy {
    /// Build a policy from a `blocking` flag and a timeout in seconds where
    /// any negative value means "wait forever".
    #[must_use]
    pub fn from_flags(blocking: bool, timeout_secs: f64) -> Self {
        if !blocking {
            Self::NonBlocking
        } else if timeout_secs < 0.0 || !timeout_secs.is_finite() {
            Self::Forever
        } else {
            Self::Timeout(Duration::from_secs_f64(timeout_secs))
        }
    }

    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        !matches!(self, Self::NonBlocking)
    }
}

/// Tracks elapsed time against a [`WaitPolicy`].
#[derive(Debug)]
pub(crate) struct Deadline {
    started: Instant,
    policy: WaitPolicy,
}

impl Deadline {
    pub(crate) fn start(policy: WaitPolicy) -> Self {
        Self {
            started: Instant::now(),
            policy,
        }
    }

    pub(crate) fn waited(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleep before the next attempt. Returns `false` when the budget is
    /// spent and the caller should give up.
    pub(crate) async fn pause(
        &self,
        interval: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let nap = match self.policy {
            WaitPolicy::NonBlocking => return Ok(false),
            WaitPolicy::Forever => interval,
            WaitPolicy::Timeout(limit) => {
                let left = limit.saturating_sub(self.waited());
                if left.is_zero() {
                    return Ok(false);
                }
                interval.min(left)
            }
        };
        match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Err(Error::Cancelled),
                    () = tokio::time::sleep(nap) => Ok(true),
                }
            }
            None => {
                tokio::time::sleep(nap).await;
                Ok(true)
            }
        }
    }
}
