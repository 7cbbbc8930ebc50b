//! Long-poll reads over a [`WatchSet`].

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use vigil_core::config::env_secs;
use vigil_core::{Index, VigilResult};

use crate::watch::{WatchOutcome, WatchSet};

/// Caller-supplied blocking parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Return only once the result index exceeds this value (0 = never block).
    pub min_query_index: Index,
    /// Requested wait; zero selects the configured default.
    pub max_query_time: Duration,
    pub allow_stale: bool,
    pub token: String,
}

impl QueryOptions {
    pub fn blocking(min_query_index: Index, max_query_time: Duration) -> Self {
        Self { min_query_index, max_query_time, ..Self::default() }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingConfig {
    pub default_query_time: Duration,
    pub max_query_time: Duration,
    /// Up to `timeout / jitter_fraction` is added to every wait (0 disables jitter).
    pub jitter_fraction: u32,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self { default_query_time: Duration::from_secs(300), max_query_time: Duration::from_secs(600), jitter_fraction: 16 }
    }
}

impl BlockingConfig {
    /// `VIGIL_BLOCKING_DEFAULT_SECS`, `VIGIL_BLOCKING_MAX_SECS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_query_time: env_secs("VIGIL_BLOCKING_DEFAULT_SECS", d.default_query_time),
            max_query_time: env_secs("VIGIL_BLOCKING_MAX_SECS", d.max_query_time),
            ..d
        }
    }

    /// Timeout actually waited for a requested `max_query_time`, jitter included.
    pub fn effective_timeout(&self, requested: Duration) -> Duration {
        let base = if requested.is_zero() { self.default_query_time } else { requested };
        let base = base.min(self.max_query_time);
        if self.jitter_fraction == 0 {
            return base;
        }
        let spread = base / self.jitter_fraction;
        if spread.is_zero() {
            return base;
        }
        base + rand::thread_rng().gen_range(Duration::ZERO..=spread)
    }
}

/// Run `f` as a blocking query.
///
/// * `min_query_index == 0`: `f` runs once and its result is returned.
/// * a result index above `min_query_index` is returned at once.
/// * otherwise the call waits for the WatchSet `f` filled to fire (or the timeout), re-runs
///   `f` once and returns that result whether or not the index moved.
/// * errors from `f` return immediately; cancellation returns the last result without error.
///
/// A result index of 0 is reported as 1 so long-poll clients never spin on 0.
pub async fn blocking_query<T, F>(
    cancel: &CancellationToken,
    opts: &QueryOptions,
    config: &BlockingConfig,
    mut f: F,
) -> VigilResult<(Index, T)>
where
    F: FnMut(&mut WatchSet) -> VigilResult<(Index, T)>,
{
    let started = Instant::now();
    let mut ws = WatchSet::new();
    let (index, value) = f(&mut ws)?;
    let index = index.max(1);
    if opts.min_query_index == 0 || index > opts.min_query_index {
        counter!("blocking_queries_total", 1u64, "outcome" => "immediate");
        return Ok((index, value));
    }

    let timeout = config.effective_timeout(opts.max_query_time);
    let outcome = ws.wait(cancel, timeout).await;
    histogram!("blocking_query_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
    trace!(min_index = opts.min_query_index, ?outcome, "blocking query woke");
    match outcome {
        WatchOutcome::Canceled => {
            counter!("blocking_queries_total", 1u64, "outcome" => "canceled");
            Ok((index, value))
        }
        WatchOutcome::Fired | WatchOutcome::TimedOut => {
            let label = if outcome == WatchOutcome::Fired { "fired" } else { "timeout" };
            counter!("blocking_queries_total", 1u64, "outcome" => label);
            let mut ws = WatchSet::new();
            let (index, value) = f(&mut ws)?;
            Ok((index.max(1), value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_uses_default_and_clamps_to_max() {
        let cfg = BlockingConfig { jitter_fraction: 0, ..BlockingConfig::default() };
        assert_eq!(cfg.effective_timeout(Duration::ZERO), Duration::from_secs(300));
        assert_eq!(cfg.effective_timeout(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(cfg.effective_timeout(Duration::from_secs(3600)), Duration::from_secs(600));
    }

    #[test]
    fn jitter_is_positive_and_bounded() {
        let cfg = BlockingConfig::default();
        for _ in 0..100 {
            let t = cfg.effective_timeout(Duration::from_secs(16));
            assert!(t >= Duration::from_secs(16));
            assert!(t <= Duration::from_secs(17));
        }
    }

    #[tokio::test]
    async fn zero_index_is_reported_as_one() {
        let cancel = CancellationToken::new();
        let (index, v) = blocking_query(&cancel, &QueryOptions::default(), &BlockingConfig::default(), |_| Ok((0, "x")))
            .await
            .expect("ok");
        assert_eq!(index, 1);
        assert_eq!(v, "x");
    }

    #[tokio::test]
    async fn error_returns_without_waiting() {
        let cancel = CancellationToken::new();
        let opts = QueryOptions::blocking(10, Duration::from_secs(30));
        let started = Instant::now();
        let res: VigilResult<(Index, ())> = blocking_query(&cancel, &opts, &BlockingConfig::default(), |_| {
            Err(vigil_core::VigilError::PermissionDenied("operator:read not allowed".into()))
        })
        .await;
        assert!(matches!(res, Err(vigil_core::VigilError::PermissionDenied(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
