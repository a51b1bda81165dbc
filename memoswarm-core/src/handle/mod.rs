//! Waiting on results.
//!
//! Swarmed calls hand back an [`ExecutionResultAddress`] right away. The
//! result shows up at that address whenever some worker gets to it, and
//! [`WaitPolicy`] decides how long a reader keeps looking.
use std::{
    marker::PhantomData,
    time::{Duration, Instant},
};

use rand::Rng;
use serde::de::DeserializeOwned;

use crate::{address::ExecutionResultAddress, error::Result, runtime::Runtime};

/// How long to wait for a result that is not there yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Check once; a missing result is [`Error::NotReady`](crate::Error::NotReady).
    Immediate,
    /// Poll with jittered exponential backoff until `timeout`, then fail with
    /// [`Error::Timeout`](crate::Error::Timeout).
    Poll {
        timeout: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl WaitPolicy {
    /// Polls for up to `timeout` with the default backoff bounds.
    pub fn poll(timeout: Duration) -> Self {
        Self::Poll {
            timeout,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }

    pub(crate) fn poller(&self) -> Poller {
        Poller::new(*self)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::poll(Duration::from_secs(30))
    }
}

/// Paces repeated checks according to a [`WaitPolicy`].
pub(crate) struct Poller {
    started: Instant,
    deadline: Option<Instant>,
    next: Duration,
    max: Duration,
}

impl Poller {
    fn new(policy: WaitPolicy) -> Self {
        let started = Instant::now();
        match policy {
            WaitPolicy::Immediate => Self {
                started,
                deadline: None,
                next: Duration::ZERO,
                max: Duration::ZERO,
            },
            WaitPolicy::Poll {
                timeout,
                initial_backoff,
                max_backoff,
            } => Self {
                started,
                deadline: Some(started + timeout),
                next: initial_backoff,
                max: max_backoff.max(initial_backoff),
            },
        }
    }

    /// Whether this poller ever waits.
    pub(crate) fn is_immediate(&self) -> bool {
        self.deadline.is_none()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleeps until the next check. Returns `false`, without sleeping, once
    /// the deadline has passed.
    pub(crate) async fn wait(&mut self) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let jittered = self.next.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
        tokio::time::sleep(jittered.min(remaining)).await;
        self.next = (self.next * 2).min(self.max);
        true
    }
}

/// A typed view of a result address.
pub struct ResultHandle<T> {
    address: ExecutionResultAddress,
    _output: PhantomData<fn() -> T>,
}

impl<T> ResultHandle<T> {
    pub(crate) fn new(address: ExecutionResultAddress) -> Self {
        Self {
            address,
            _output: PhantomData,
        }
    }

    pub fn address(&self) -> &ExecutionResultAddress {
        &self.address
    }

    pub fn into_address(self) -> ExecutionResultAddress {
        self.address
    }
}

impl<T: DeserializeOwned> ResultHandle<T> {
    pub async fn ready(&self, runtime: &Runtime) -> Result<bool> {
        runtime.ready(&self.address).await
    }

    pub async fn get(&self, runtime: &Runtime, policy: WaitPolicy) -> Result<T> {
        runtime.get_typed(&self.address, policy).await
    }
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self::new(self.address.clone())
    }
}

impl<T> std::fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResultHandle").field(&self.address).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_never_waits() {
        let mut poller = WaitPolicy::Immediate.poller();
        assert!(poller.is_immediate());
        assert!(!poller.wait().await);
    }

    #[tokio::test]
    async fn poll_stops_at_the_deadline() {
        let mut poller = WaitPolicy::Poll {
            timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
        .poller();
        let mut waits = 0;
        while poller.wait().await {
            waits += 1;
            assert!(poller.next <= Duration::from_millis(40));
        }
        assert!(waits >= 5);
        assert!(poller.elapsed() >= Duration::from_millis(200));
    }
}
