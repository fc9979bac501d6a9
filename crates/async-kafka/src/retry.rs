//! Retry policy for the group session loop.
//!
//! The session loop counts consecutive failing sessions and asks the policy how
//! long to wait before re-entering the group protocol. A clean session resets
//! the count. The default policy re-enters immediately and never gives up.

use std::time::Duration;

/// Delay curve between failing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Re-enter immediately.
    #[default]
    None,
    Constant(Duration),
    /// `initial * factor^(failures - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: u32,
    },
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exponent = failures.saturating_sub(1);
                let multiplier = factor.saturating_pow(exponent);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Give up once this many consecutive sessions failed.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Give up once failures have been going on for this long.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Unbounded retries without any delay.
    pub fn forever() -> Self {
        Self::default()
    }

    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
            max_elapsed: None,
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// How long to wait before the next session, or `None` to give up.
    ///
    /// `failures` is the number of consecutive failed sessions so far and
    /// `elapsed` the time since the first of them.
    pub fn next_delay(&self, failures: u32, elapsed: Duration) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if failures >= max {
                return None;
            }
        }
        if let Some(limit) = self.max_elapsed {
            if elapsed >= limit {
                return None;
            }
        }
        Some(self.backoff.delay(failures))
    }
}
