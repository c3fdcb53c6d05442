// src/cache/retry.rs

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Retries a fallible operation with randomized exponential backoff.
///
/// Attempt `n` (1-based) that fails sleeps `base * e^n`, where `e` is drawn
/// once per [`RetryPolicy::run`] from `[2, 4)`, never more than `max_delay`.
/// The error of the last attempt is returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            base: Duration::from_millis(5),
            max_delay: Duration::from_millis(20_480),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let exponent: f64 = rand::rng().random_range(2.0..4.0);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts.max(1) => return Err(err),
                Err(err) => {
                    let delay = self.delay(exponent, attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying cache operation"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn delay(&self, exponent: f64, attempt: u32) -> Duration {
        let millis = self.base.as_secs_f64() * 1000.0 * exponent.powi(attempt as i32);
        Duration::from_secs_f64(millis / 1000.0).min(self.max_delay)
    }
}
