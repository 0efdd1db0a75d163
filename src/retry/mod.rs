//! Exponential backoff for rate-limited transport calls.
//!
//! [`RetryPolicy::run`] gives one logical call several attempts against
//! transient throttling. Only failures for which
//! [`TransportError::is_rate_limited`] holds are retried; any other failure is
//! returned on the spot. Once the retry budget is spent the call fails with
//! [`Error::RetryExhausted`], which is meant to be shown to the user.
//!
//! Backoff sleeps are independent of the queue's dispatch spacing: a retry
//! reacts to one rejected call and does not take a new queue slot.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::{Error, TransportError};

/// Default width of the uniform jitter window added to every backoff delay.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(1000);

/// How many times, and how patiently, to retry a throttled call.
///
/// The delay before retry `n` (1-based) is
/// `initial_delay * 2^(n-1)` plus a random jitter drawn from `[0, jitter)`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sluice::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(2));
/// assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
/// assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry, doubled for each subsequent one.
    pub initial_delay: Duration,

    /// Width of the jitter window. `Duration::ZERO` disables jitter.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the default one-second jitter window.
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Sets the jitter window.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the deterministic part of the delay before retry `attempt`
    /// (1-based). Saturates instead of overflowing for large attempt counts.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    // Total delay before retry `attempt`, jitter included.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt).saturating_add(jitter_delay(self.jitter))
    }

    /// Runs `f`, retrying rate-limited failures according to this policy.
    ///
    /// `f` is called once per attempt, so it must be able to rebuild its
    /// request each time.
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] with the original error when `f` fails with a
    ///   non-rate-limit error. No further attempts are made.
    /// - [`Error::RetryExhausted`] when `f` is still rate-limited after
    ///   `max_retries` retries.
    pub async fn run<F, Fut, T>(&self, mut f: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limited() => e,
                Err(e) => return Err(Error::Transport(e)),
            };

            attempt += 1;
            if attempt > self.max_retries {
                error!(attempts = attempt, error = %err, "rate limit persisted past retry budget");
                return Err(Error::RetryExhausted { attempts: attempt });
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "rate limited; backing off"
            );
            sleep(delay).await;
        }
    }
}

/// Runs `f` under a [`RetryPolicy`] built from `max_retries` and
/// `initial_delay`, with the default jitter window.
///
/// Typically composed inside a queued task:
///
/// ```rust,no_run
/// use std::time::Duration;
/// use sluice::{Error, TransportError, queue::{QueueConfig, RequestQueue}, retry_with_backoff};
///
/// async fn call_model() -> Result<String, TransportError> {
///     Ok("a receipt".into())
/// }
///
/// # async fn demo() -> Result<(), Error> {
/// let queue = RequestQueue::in_memory(QueueConfig::default());
/// let text = queue
///     .add(|| retry_with_backoff(call_model, 3, Duration::from_secs(5)), 10)
///     .await?;
/// println!("{text}");
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    f: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    RetryPolicy::new(max_retries, initial_delay).run(f).await
}

fn jitter_delay(window: Duration) -> Duration {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..window_ms))
}
