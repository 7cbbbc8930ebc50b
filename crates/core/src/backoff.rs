use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::config::env_or;

/// Bounded exponential backoff with additive jitter.
///
/// `delay(n)` is `min(base * multiplier^(n-1), max)` plus up to `jitter` of that value,
/// capped again at `max`. With `jitter < 1` and `multiplier >= 2` the uncapped delays are
/// strictly increasing.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Fraction of the delay added at random, clamped to [0, 0.99]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Retry ceiling (0 means unlimited)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> u32 {
    2
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_retries() -> u32 {
    0
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base_delay_ms: base.as_millis() as u64, max_delay_ms: max.as_millis() as u64, ..Self::default() }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Read `{prefix}_BACKOFF_BASE_MS`, `{prefix}_BACKOFF_MAX_MS` and `{prefix}_MAX_RETRIES`
    /// on top of `fallback`.
    pub fn from_env(prefix: &str, fallback: BackoffPolicy) -> Self {
        Self {
            base_delay_ms: env_or(&format!("{prefix}_BACKOFF_BASE_MS"), fallback.base_delay_ms),
            max_delay_ms: env_or(&format!("{prefix}_BACKOFF_MAX_MS"), fallback.max_delay_ms),
            max_retries: env_or(&format!("{prefix}_MAX_RETRIES"), fallback.max_retries),
            ..fallback
        }
    }

    /// Whether `attempt` (1-based count of failures so far) exceeded the retry ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries != 0 && attempt > self.max_retries
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let max = self.max_delay_ms.max(self.base_delay_ms);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(attempt - 1);
        let raw = self.base_delay_ms.saturating_mul(factor).min(max);
        let jitter = self.jitter.clamp(0.0, 0.99);
        let spread = (raw as f64 * jitter) as u64;
        let extra = if spread == 0 { 0 } else { rand::thread_rng().gen_range(0..=spread) };
        Duration::from_millis(raw.saturating_add(extra).min(max))
    }
}
