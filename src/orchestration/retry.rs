//! Delay between a failed attempt and the next one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a failed task waits before it is dispatched again.
///
/// Configured under `[retry]`:
///
/// ```toml
/// [retry]
/// strategy = "exponential"
/// base_ms = 100
/// max_ms = 5000
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Re-queue right away.
    #[default]
    Immediate,
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Wait `base * 2^(k-1)` after the k-th failed attempt, capped at `max`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        RetryPolicy::Exponential {
            base_ms: duration_ms(base),
            max_ms: duration_ms(max),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryPolicy::Exponential { base_ms, max_ms } => {
                let exp = 1u64 << attempt.saturating_sub(1).min(32);
                Duration::from_millis(base_ms.saturating_mul(exp).min(max_ms))
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
