//! Client-side tuning for the messaging core, loaded from environment
//! variables.
//!
//! Every setting has a default so hosts can start with zero configuration.

use std::time::Duration;

use concierge_shared::constants::{
    APPEND_TIMEOUT_SECS, BACKFILL_TIMEOUT_SECS, BUS_BUFFER, INBOX_POLL_SECS, RETRY_INITIAL_MS,
    RETRY_MAX_MS, TYPING_DEBOUNCE_MS, TYPING_TTL_MS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// How long a typing signal stays live without a refresh.
    /// Env: `CONCIERGE_TYPING_TTL_MS`
    /// Default: 5 s
    pub typing_ttl: Duration,

    /// Minimum spacing between outbound typing broadcasts.
    /// Env: `CONCIERGE_TYPING_DEBOUNCE_MS`
    /// Default: 1.5 s
    pub typing_debounce: Duration,

    /// Bound on one backfill round trip.
    /// Env: `CONCIERGE_BACKFILL_TIMEOUT_MS`
    /// Default: 10 s
    pub backfill_timeout: Duration,

    /// Bound on one append round trip.
    /// Env: `CONCIERGE_APPEND_TIMEOUT_MS`
    /// Default: 10 s
    pub append_timeout: Duration,

    /// Safety-net re-poll interval for the staff inbox.
    /// Env: `CONCIERGE_INBOX_POLL_MS`
    /// Default: 15 s
    pub inbox_poll_interval: Duration,

    /// First and maximum delay between read-path retries.
    /// Env: `CONCIERGE_RETRY_INITIAL_MS`, `CONCIERGE_RETRY_MAX_MS`
    /// Default: 250 ms, 8 s
    pub retry_initial: Duration,
    pub retry_max: Duration,

    /// Per-subscriber realtime buffer, in frames.
    /// Env: `CONCIERGE_BUS_BUFFER`
    /// Default: 256
    pub bus_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_millis(TYPING_TTL_MS),
            typing_debounce: Duration::from_millis(TYPING_DEBOUNCE_MS),
            backfill_timeout: Duration::from_secs(BACKFILL_TIMEOUT_SECS),
            append_timeout: Duration::from_secs(APPEND_TIMEOUT_SECS),
            inbox_poll_interval: Duration::from_secs(INBOX_POLL_SECS),
            retry_initial: Duration::from_millis(RETRY_INITIAL_MS),
            retry_max: Duration::from_millis(RETRY_MAX_MS),
            bus_buffer: BUS_BUFFER,
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(d) = env_millis("CONCIERGE_TYPING_TTL_MS") {
            config.typing_ttl = d;
        }
        if let Some(d) = env_millis("CONCIERGE_TYPING_DEBOUNCE_MS") {
            config.typing_debounce = d;
        }
        if let Some(d) = env_millis("CONCIERGE_BACKFILL_TIMEOUT_MS") {
            config.backfill_timeout = d;
        }
        if let Some(d) = env_millis("CONCIERGE_APPEND_TIMEOUT_MS") {
            config.append_timeout = d;
        }
        if let Some(d) = env_millis("CONCIERGE_INBOX_POLL_MS") {
            config.inbox_poll_interval = d;
        }
        if let Some(d) = env_millis("CONCIERGE_RETRY_INITIAL_MS") {
            config.retry_initial = d;
        }
        if let Some(d) = env_millis("CONCIERGE_RETRY_MAX_MS") {
            config.retry_max = d;
        }

        if let Ok(raw) = std::env::var("CONCIERGE_BUS_BUFFER") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.bus_buffer = n,
                _ => tracing::warn!(value = %raw, "Invalid CONCIERGE_BUS_BUFFER, using default"),
            }
        }

        if config.retry_max < config.retry_initial {
            tracing::warn!(
                initial = ?config.retry_initial,
                max = ?config.retry_max,
                "Retry max below initial delay, clamping"
            );
            config.retry_max = config.retry_initial;
        }

        config
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            tracing::warn!(var = name, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
        assert!(config.typing_debounce < config.typing_ttl);
        assert!(config.retry_initial <= config.retry_max);
    }

    #[test]
    fn test_env_millis() {
        std::env::set_var("CONCIERGE_TEST_ENV_MILLIS_OK", "1200");
        std::env::set_var("CONCIERGE_TEST_ENV_MILLIS_BAD", "soon");
        std::env::set_var("CONCIERGE_TEST_ENV_MILLIS_ZERO", "0");

        assert_eq!(
            env_millis("CONCIERGE_TEST_ENV_MILLIS_OK"),
            Some(Duration::from_millis(1200))
        );
        assert_eq!(env_millis("CONCIERGE_TEST_ENV_MILLIS_BAD"), None);
        assert_eq!(env_millis("CONCIERGE_TEST_ENV_MILLIS_ZERO"), None);
        assert_eq!(env_millis("CONCIERGE_TEST_ENV_MILLIS_UNSET"), None);
    }
}
