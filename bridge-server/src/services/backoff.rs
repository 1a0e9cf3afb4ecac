use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on jitter; with at most half the delay shaved off, a doubled
/// delay is still longer than the one before it.
pub const MAX_JITTER: f64 = 0.5;

/// Exponential backoff: `base * 2^(retry-1)`, capped, minus up to `jitter` of itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    2_000
}

fn default_cap_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_ms == 0 {
            return Err("backoff base_ms must be at least 1".into());
        }
        if self.cap_ms < self.base_ms {
            return Err("backoff cap_ms must not be below base_ms".into());
        }
        if !(0.0..=MAX_JITTER).contains(&self.jitter) {
            return Err(format!("backoff jitter must be between 0 and {MAX_JITTER}"));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with(retry, rand::random::<f64>())
    }

    /// Same as [`delay`](Self::delay) with the jitter sample (0..1) supplied.
    pub fn delay_with(&self, retry: u32, sample: f64) -> Duration {
        let shift = retry.saturating_sub(1).min(32);
        let exp = self
            .base_ms
            .saturating_mul(1u64 << shift)
            .min(self.cap_ms);
        let shaved = (exp as f64 * self.jitter * sample.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(exp - shaved.min(exp))
    }
}
