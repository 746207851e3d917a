//! Retry policy for backend operations.
//!
//! The policy is plain data plus pure decision functions, so classification
//! and backoff can be tested without touching the network. [`RetryPolicy::run`]
//! is the only part that sleeps.
//!
//! Per logical operation:
//!
//! ```text
//! Attempting -> Success
//!            -> RetryableFailure -> (backoff) -> Attempting
//!            -> TerminalFailure
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blob::BlobId;
use crate::context::OpContext;
use crate::error::{Error, Result};

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    Fail,
}

/// Describes the operation being retried, for logging.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub name: &'static str,
    pub blob: Option<&'a BlobId>,
}

impl<'a> Operation<'a> {
    pub fn new(name: &'static str) -> Self {
        Self { name, blob: None }
    }

    pub fn on(name: &'static str, blob: &'a BlobId) -> Self {
        Self {
            name,
            blob: Some(blob),
        }
    }
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.blob {
            Some(id) => write!(f, "{}({})", self.name, id),
            None => f.write_str(self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, between 0 and 1
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfiguration("retry.max_attempts must be at least 1".into()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfiguration("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidConfiguration("retry.jitter must be between 0 and 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::InvalidConfiguration(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Only transient failures are retried. Authentication, configuration,
    /// malformed requests, not-found, cancellation and use-after-close all
    /// propagate on first occurrence.
    pub fn classify(&self, err: &Error) -> Disposition {
        if err.is_retryable() {
            Disposition::Retryable
        } else {
            Disposition::Terminal
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// `sample` in `[0, 1)` picks the jittered point: the delay falls in
    /// `[base * (1 - jitter), base]` where `base` grows geometrically and is
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = (self.initial_backoff_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64);
        let sample = sample.clamp(0.0, 1.0);
        let delay = base * (1.0 - self.jitter) + base * self.jitter * sample;
        Duration::from_millis(delay.round() as u64)
    }

    pub fn decide(&self, attempt: u32, err: &Error, sample: f64) -> Decision {
        if self.classify(err) == Disposition::Terminal || attempt >= self.max_attempts {
            return Decision::Fail;
        }
        let delay = self.backoff(attempt, sample);
        match err.retry_after() {
            Some(hint) if hint > delay => Decision::Retry(hint),
            _ => Decision::Retry(delay),
        }
    }

    /// Run `f` until it succeeds, fails terminally, or the attempt budget is
    /// spent. Exhaustion returns the last underlying error. Cancellation of
    /// `ctx` aborts immediately, including during a backoff sleep.
    pub async fn run<T, F, Fut>(&self, ctx: &OpContext, op: Operation<'_>, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            ctx.check()?;
            let err = match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = %op, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let sample = rand::thread_rng().gen::<f64>();
            match self.decide(attempt, &err, sample) {
                Decision::Fail => {
                    if err.is_retryable() {
                        warn!(op = %op, attempts = attempt, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }
                Decision::Retry(delay) => {
                    warn!(
                        op = %op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure"
                    );
                    ctx.sleep(delay).await?;
                }
            }
            attempt += 1;
        }
    }
}
