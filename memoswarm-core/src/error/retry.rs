//! Retry strategies for transient storage failures.
use std::{num::NonZeroU32, time::Duration};

use futures::Future;
use tracing::warn;

const DEFAULT_MAX_RETRIES: NonZeroU32 = match NonZeroU32::new(3) {
    Some(n) => n,
    None => unreachable!(),
};

/// A retry strategy for operations that fail transiently.
///
/// - `Immediate`: Retry right away, up to `max_retries` times (default).
/// - `After`: Retry after a fixed duration.
/// - `Exponential`: Retry with exponential backoff until `max_duration` has
///   elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry the operation immediately.
    Immediate { max_retries: NonZeroU32 },
    /// Retry the operation after a specified duration.
    After {
        max_retries: NonZeroU32,
        duration: Duration,
    },
    /// Retry the operation with exponential backoff.
    Exponential {
        min_duration: Duration,
        max_duration: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Immediate {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryStrategy {
    /// Retry the operation according to the strategy, logging each failed
    /// attempt.
    pub async fn retry<O, E, Fut, F>(self, what: &str, f: F) -> std::result::Result<O, E>
    where
        E: std::fmt::Display,
        Fut: Future<Output = std::result::Result<O, E>>,
        F: Fn() -> Fut,
    {
        let tracer = |err: &E| warn!(operation = what, error = %err, "transient failure, retrying");
        match self {
            Self::Immediate { max_retries } => retry_simple(f, max_retries, None, tracer).await,
            Self::After {
                max_retries,
                duration,
            } => retry_simple(f, max_retries, Some(duration), tracer).await,
            Self::Exponential {
                min_duration,
                max_duration,
            } => {
                let backoff = backoff::ExponentialBackoffBuilder::new()
                    .with_initial_interval(min_duration)
                    .with_max_elapsed_time(Some(max_duration))
                    .build();
                backoff::future::retry_notify(
                    backoff,
                    || {
                        let attempt = f();
                        async move { attempt.await.map_err(backoff::Error::transient) }
                    },
                    |err: E, _| tracer(&err),
                )
                .await
            }
        }
    }
}

/// Retries a future with the given maximum number of retries and delay.
async fn retry_simple<O, E, Fut, F, T>(
    f: F,
    max_retries: NonZeroU32,
    delay: Option<Duration>,
    tracer: T,
) -> std::result::Result<O, E>
where
    Fut: Future<Output = std::result::Result<O, E>>,
    F: Fn() -> Fut,
    T: Fn(&E),
{
    let mut num_retries = 0;
    loop {
        match f().await {
            Ok(output) => return Ok(output),
            Err(err) if num_retries >= max_retries.get() => return Err(err),
            Err(err) => {
                tracer(&err);
                num_retries += 1;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    async fn flaky(counter: Arc<AtomicU32>, succeed_on: u32) -> Result<u32, String> {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= succeed_on {
            Ok(attempt)
        } else {
            Err(format!("attempt {attempt} failed"))
        }
    }

    #[tokio::test]
    async fn immediate_recovers_within_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let result = RetryStrategy::default()
            .retry("flaky", || flaky(counter.clone(), 3))
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn immediate_gives_up_after_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let result = RetryStrategy::Immediate {
            max_retries: NonZeroU32::new(2).unwrap(),
        }
        .retry("flaky", || flaky(counter.clone(), 10))
        .await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exponential_recovers() {
        let counter = Arc::new(AtomicU32::new(0));
        let result = RetryStrategy::Exponential {
            min_duration: Duration::from_millis(1),
            max_duration: Duration::from_secs(5),
        }
        .retry("flaky", || flaky(counter.clone(), 3))
        .await;
        assert_eq!(result, Ok(3));
    }
}
