//! Bounded polling primitive used to observe asynchronous completion of
//! remote operations.
//!
//! A [`ConditionLatch`] repeatedly evaluates a predicate until it reports
//! success, the predicate fails fatally, or the deadline elapses. Predicates
//! distinguish "not ready yet" from fatal failures through [`Probe`], so the
//! latch never has to inspect error messages.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// Interval between predicate evaluations when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Message reported when the latch times out and no message is configured.
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Operation timed out";

/// Non-success outcome of a single predicate evaluation.
#[derive(Debug)]
pub enum Probe<E> {
    /// The condition is not met yet. The latch keeps polling.
    NotReady(String),
    /// The condition can never be met. The latch aborts immediately.
    Fatal(E),
}

/// Errors returned by [`ConditionLatch::wait_for`].
#[derive(Debug, Error)]
pub enum LatchError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the deadline elapses before the predicate succeeds.
    #[error("{message}")]
    TimedOut {
        /// Configured timeout message.
        message: String,
    },
    /// Raised when the predicate reports a fatal failure.
    #[error(transparent)]
    Aborted(E),
}

/// Polls a predicate on a fixed interval until it succeeds or time runs out.
#[derive(Clone, Debug)]
pub struct ConditionLatch {
    timeout: Duration,
    poll_interval: Duration,
    timeout_message: String,
    verbose: bool,
}

impl ConditionLatch {
    /// Creates a latch with the given timeout and default interval and
    /// message.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout_message: String::from(DEFAULT_TIMEOUT_MESSAGE),
            verbose: false,
        }
    }

    /// Overrides the interval between predicate evaluations.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the message reported on timeout.
    #[must_use]
    pub fn with_timeout_message(mut self, message: impl Into<String>) -> Self {
        self.timeout_message = message.into();
        self
    }

    /// Logs every unmet evaluation at info level instead of debug.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Returns the configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for `predicate` using a deadline computed from the configured
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::TimedOut`] when the timeout elapses and
    /// [`LatchError::Aborted`] when the predicate fails fatally.
    pub async fn wait_for<F, Fut, E>(&self, predicate: F) -> Result<(), LatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, Probe<E>>>,
        E: std::error::Error + 'static,
    {
        self.wait_until(Instant::now() + self.timeout, predicate)
            .await
    }

    /// Waits for `predicate` until the absolute `deadline`.
    ///
    /// The predicate is evaluated once straight away, then after every poll
    /// interval. The final sleep is shortened so the last evaluation happens
    /// at the deadline rather than after it.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::TimedOut`] when the deadline elapses and
    /// [`LatchError::Aborted`] when the predicate fails fatally.
    pub async fn wait_until<F, Fut, E>(
        &self,
        deadline: Instant,
        mut predicate: F,
    ) -> Result<(), LatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, Probe<E>>>,
        E: std::error::Error + 'static,
    {
        loop {
            let reason = match predicate().await {
                Ok(true) => return Ok(()),
                Ok(false) => None,
                Err(Probe::NotReady(reason)) => Some(reason),
                Err(Probe::Fatal(err)) => return Err(LatchError::Aborted(err)),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LatchError::TimedOut {
                    message: self.timeout_message.clone(),
                });
            }

            let pause = self.poll_interval.min(deadline - now);
            self.report_pending(reason.as_deref(), pause);
            sleep(pause).await;
        }
    }

    fn report_pending(&self, reason: Option<&str>, pause: Duration) {
        let label = reason.unwrap_or("condition not met");
        let seconds = pause.as_secs();
        if self.verbose {
            info!(reason = label, "next check in {seconds} seconds");
        } else {
            debug!(reason = label, "next check in {seconds} seconds");
        }
    }
}
