//! Backoff for listing-service requests
//!
//! A page request that fails transiently (timeout, rate limit, 5xx) is
//! repeated with growing delays before the run gives up on the collection.
//! Work items never go through here; one outcome per item is final.

use crate::config::RetryConfig;
use crate::error::SourceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies errors as worth repeating or not
pub trait IsRetryable {
    /// Whether the failure is transient
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network(e) => e.is_timeout() || e.is_connect(),
            SourceError::Unavailable { .. } => true,
            SourceError::Rejected { .. }
            | SourceError::NotFound { .. }
            | SourceError::Malformed(_)
            | SourceError::PaginationLoop(_) => false,
        }
    }
}

/// Delay schedule derived from a [`RetryConfig`]
///
/// Yields at most `max_attempts` delays, each `backoff_multiplier` times the
/// previous one and capped at `max_delay`. With jitter enabled a delay lands
/// anywhere in `[d, 2d]`.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    remaining: u32,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a fresh schedule
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            remaining: config.max_attempts,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter,
        }
    }

    /// Delays still available
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.next;
        self.next = Duration::try_from_secs_f64(base.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        Some(if self.jitter { add_jitter(base) } else { base })
    }
}

/// Run `operation` until it succeeds, fails permanently, or the schedule runs out
///
/// `what` names the request in log lines.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt: u32 = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(what, attempt, "request succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            tracing::debug!(what, error = %err, "permanent failure, not retrying");
            return Err(err);
        }
        let Some(delay) = backoff.next() else {
            tracing::error!(what, attempts = attempt, error = %err, "giving up after retries");
            return Err(err);
        };

        tracing::warn!(
            what,
            attempt,
            retries_left = backoff.remaining(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + factor)).unwrap_or(delay)
}
