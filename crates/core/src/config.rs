//! Environment-driven configuration helpers (`VIGIL_*`).

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` from the environment, falling back to `default` when unset or malformed.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring malformed environment override");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

pub fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_when_missing_or_malformed() {
        assert_eq!(env_or("VIGIL_TEST_CONFIG_UNSET_KEY", 7usize), 7);
        std::env::set_var("VIGIL_TEST_CONFIG_MALFORMED", "not-a-number");
        assert_eq!(env_or("VIGIL_TEST_CONFIG_MALFORMED", 3u64), 3);
        std::env::set_var("VIGIL_TEST_CONFIG_SET", " 42 ");
        assert_eq!(env_or("VIGIL_TEST_CONFIG_SET", 0u32), 42);
        assert_eq!(env_secs("VIGIL_TEST_CONFIG_SET", Duration::ZERO), Duration::from_secs(42));
        assert_eq!(env_millis("VIGIL_TEST_CONFIG_SET", Duration::ZERO), Duration::from_millis(42));
        assert_eq!(env_millis("VIGIL_TEST_CONFIG_UNSET_KEY", Duration::from_millis(250)), Duration::from_millis(250));
    }
}
