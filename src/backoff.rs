// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exponential Backoff
//!
//! The single retry schedule shared by the initial connect, the reconnect loop
//! and publish retries.

use std::time::Duration;

/// Default delay for the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Default upper bound for any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Maps an attempt number to a wait duration: `min(max, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Creates a policy with the given bounds. A `max` smaller than `base` is raised to `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the delay to wait after the failed attempt `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
