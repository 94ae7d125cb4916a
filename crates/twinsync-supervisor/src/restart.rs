//! Restart and reconnect cooldowns built on the `backoff` crate

use backoff::backoff::{Backoff, Constant};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use twinsync_core::CooldownPolicy;

/// How long to wait before retrying after a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same pause every time
    Fixed { secs: u64 },

    /// Growing pause, capped at `max_secs`; never gives up
    Exponential {
        initial_ms: u64,
        max_secs: u64,
        multiplier: f64,
        #[serde(default)]
        jitter: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { secs: 5 }
    }
}

impl RetryPolicy {
    pub fn fixed(cooldown: Duration) -> Self {
        RetryPolicy::Fixed {
            secs: cooldown.as_secs(),
        }
    }

    /// Cooldown policy for one handler or supervised slot
    pub fn cooldown(&self) -> Box<dyn CooldownPolicy> {
        match self {
            RetryPolicy::Fixed { secs } => {
                let pause = Duration::from_secs(*secs);
                Box::new(BackoffCooldown::new(Constant::new(pause), pause))
            }
            RetryPolicy::Exponential {
                initial_ms,
                max_secs,
                multiplier,
                jitter,
            } => {
                let max = Duration::from_secs(*max_secs);
                Box::new(BackoffCooldown::new(
                    exponential(Duration::from_millis(*initial_ms), max, *multiplier, *jitter),
                    max,
                ))
            }
        }
    }
}

fn exponential(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_multiplier(multiplier)
        .with_randomization_factor(jitter.clamp(0.0, 1.0))
        .with_max_elapsed_time(None)
        .build()
}

/// Adapts any [`Backoff`] to the handler's [`CooldownPolicy`]
pub struct BackoffCooldown<B> {
    backoff: B,
    /// Used if the backoff reports it has given up
    ceiling: Duration,
}

impl<B: Backoff> BackoffCooldown<B> {
    pub fn new(backoff: B, ceiling: Duration) -> Self {
        Self { backoff, ceiling }
    }
}

impl<B: Backoff + Send + Sync> CooldownPolicy for BackoffCooldown<B> {
    fn next_cooldown(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(self.ceiling)
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }
}
