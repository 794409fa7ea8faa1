//! Retry with exponential backoff
//!
//! - **Exponential backoff**: `initial_backoff * multiplier^(attempt-1)`
//! - **Jitter**: ±`jitter` randomness so peers do not retry in lockstep
//! - **Cap**: backoff capped at `max_backoff`
//! - **Termination**: `Unreachable` after `max_attempts` failed attempts
//!
//! Errors that are not retryable (see `HarborError::is_retryable`) are
//! returned immediately.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::cluster::NodeId;
use crate::config::RetryPolicy;
use crate::error::{HarborError, Result};

impl RetryPolicy {
    /// Policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of
    /// attempts
    pub fn run<T, F>(&self, node: NodeId, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt == attempts {
                        debug!(node, attempts, error = %e, "giving up");
                        break;
                    }
                    let delay = apply_jitter(self.backoff(attempt), self.jitter);
                    debug!(
                        node,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    thread::sleep(delay);
                }
            }
        }
        Err(HarborError::Unreachable { node, attempts })
    }
}

fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rand::rng().random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}
