//! Exponential reconnect backoff.

use std::time::Duration;

/// Default delay before the first retry.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default ceiling for any single retry delay.
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Maps a reconnect attempt count to the time to wait before retrying.
///
/// `delay(n) = min(base * 2^n, cap)`. Pure and total: every `u32` attempt maps
/// to a delay without overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let Some(factor) = 1u32.checked_shl(attempt) else {
            return self.cap;
        };
        match self.base.checked_mul(factor) {
            Some(delay) => delay.min(self.cap),
            None => self.cap,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}
