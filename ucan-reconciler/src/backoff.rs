//! Exponential backoff for failed reconcile cycles.

use std::time::Duration;

/// Floor for the first retry delay; a zero base would retry in a hot loop.
pub const MIN_BASE: Duration = Duration::from_millis(10);

/// Delay doubling from `base` per consecutive failure, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BASE);
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base = self.base.max(MIN_BASE);
        let max = self.max.max(base);
        let exponent = (failures - 1).min(31);
        base.checked_mul(1u32 << exponent).map_or(max, |d| d.min(max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
