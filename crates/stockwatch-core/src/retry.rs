//! Retry Policy: bounded retries with exponential backoff and jitter.
//!
//! Shared by every call that crosses a process boundary (calculation,
//! mail transport). Attempt 1 runs immediately; after a transient failure
//! the policy sleeps `base_delay * 2^(attempt-1) + jitter` and tries again.
//! A non-transient failure stops the loop on the spot.
//!
//! The backoff sleep is the only place the loop waits, and it watches the
//! shutdown token: a cancelled token ends the loop at the next boundary
//! without interrupting an attempt that is already in flight.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StockWatchError;

/// Retry settings. Also the `[retry.*]` configuration sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of the uniform random jitter added to each delay.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Ceiling for a single backoff sleep (before jitter).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 2_000 }
fn default_max_jitter_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 120_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Why the retry loop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Every attempt failed with a transient error.
    ExhaustedRetries,
    /// The operation failed with an error retrying cannot fix.
    NonRetryable,
    /// Shutdown was requested while waiting to retry.
    Cancelled,
}

/// The last underlying error plus how the loop ended.
#[derive(Debug)]
pub struct TerminalError<E> {
    pub kind: TerminalKind,
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for TerminalError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TerminalKind::ExhaustedRetries => write!(
                f,
                "gave up after {} attempts, last error: {}",
                self.attempts, self.last_error
            ),
            TerminalKind::NonRetryable => {
                write!(f, "non-retryable failure: {}", self.last_error)
            }
            TerminalKind::Cancelled => write!(
                f,
                "cancelled after {} attempts, last error: {}",
                self.attempts, self.last_error
            ),
        }
    }
}

impl From<TerminalError<StockWatchError>> for StockWatchError {
    fn from(t: TerminalError<StockWatchError>) -> Self {
        match t.kind {
            TerminalKind::ExhaustedRetries => StockWatchError::RetriesExhausted {
                attempts: t.attempts,
                last_error: Box::new(t.last_error),
            },
            TerminalKind::NonRetryable => t.last_error,
            TerminalKind::Cancelled => StockWatchError::Cancelled,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter_ms = max_jitter.as_millis() as u64;
        self
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.max_jitter_ms))
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `label` is only used in logs.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut op: F,
        is_transient: P,
        cancel: &CancellationToken,
    ) -> Result<T, TerminalError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("✅ {label} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_transient(&err) {
                tracing::warn!("⛔ {label} failed with non-retryable error: {err}");
                return Err(TerminalError {
                    kind: TerminalKind::NonRetryable,
                    attempts: attempt,
                    last_error: err,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!("⛔ {label} exhausted {attempt} attempts: {err}");
                return Err(TerminalError {
                    kind: TerminalKind::ExhaustedRetries,
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.backoff(attempt) + self.jitter();
            tracing::warn!(
                "🔁 {label} attempt {attempt}/{max_attempts} failed: {err} (retrying in {delay:?})"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("🛑 {label} retry loop stopped by shutdown");
                    return Err(TerminalError {
                        kind: TerminalKind::Cancelled,
                        attempts: attempt,
                        last_error: err,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
