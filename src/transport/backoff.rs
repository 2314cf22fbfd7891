//! Exponential reconnection backoff with bounded jitter
//!
//! `backoff_delay` is a pure function of the attempt number and two
//! constants, so the growth/cap/reset properties are testable without timers.

use crate::config::ReconnectSection;
use rand::Rng;
use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
/// Attempt 0 is treated as the first attempt.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Add `sample * ratio * delay` on top of `delay`, never exceeding `cap`.
/// `sample` is expected in `[0, 1)`.
pub fn apply_jitter(delay: Duration, ratio: f64, sample: f64, cap: Duration) -> Duration {
    let factor = (ratio * sample).clamp(0.0, 1.0);
    delay.saturating_add(delay.mul_f64(factor)).min(cap)
}

/// Reconnection timing shared by both transports
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(section: &ReconnectSection) -> Self {
        Self {
            base: Duration::from_millis(section.base_delay_ms),
            cap: Duration::from_millis(section.max_delay_ms),
            max_attempts: (section.max_attempts > 0).then_some(section.max_attempts),
            jitter_ratio: section.jitter_ratio,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base, self.cap)
    }

    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        apply_jitter(self.delay_for(attempt), self.jitter_ratio, sample, self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectSection::default())
    }
}
