//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Size of the SQLite connection pool
    pub db_max_connections: u32,
    /// Port for the REST API server
    pub api_port: u16,
    /// Payment processor endpoint; the simulated gateway is used when unset
    pub gateway_url: Option<String>,
    /// Bearer token sent to the payment processor
    pub gateway_api_key: Option<String>,
    /// Upper bound on a single charge request
    pub gateway_timeout: Duration,
    /// Artificial processing delay of the simulated gateway
    pub simulated_latency: Duration,
    /// Retry policy for transient gateway failures
    pub retry: RetryPolicy,
}

/// Bounded exponential back-off for transient payment failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total charge attempts allowed per donation, across all `donate` calls.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a claimed attempt counts as in flight. A pending donation
    /// whose last attempt is older than this was abandoned by its caller.
    pub attempt_lease: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            attempt_lease: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./crowdfund.db".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "5")?,
            api_port: parse_env("API_PORT", "3001")?,
            gateway_url: env_var("GATEWAY_URL").ok().filter(|u| !u.is_empty()),
            gateway_api_key: env_var("GATEWAY_API_KEY").ok().filter(|k| !k.is_empty()),
            gateway_timeout: Duration::from_millis(parse_env("GATEWAY_TIMEOUT_MS", "10000")?),
            simulated_latency: Duration::from_millis(parse_env(
                "SIMULATED_GATEWAY_LATENCY_MS",
                "0",
            )?),
            retry: RetryPolicy {
                max_attempts: parse_env("PAYMENT_MAX_ATTEMPTS", "3")?,
                initial_backoff: Duration::from_millis(parse_env(
                    "RETRY_INITIAL_BACKOFF_MS",
                    "200",
                )?),
                max_backoff: Duration::from_millis(parse_env("RETRY_MAX_BACKOFF_MS", "5000")?),
                attempt_lease: Duration::from_secs(parse_env("PAYMENT_ATTEMPT_LEASE_SECS", "30")?),
            },
        };

        if config.retry.max_attempts == 0 {
            return Err(LedgerError::Config(
                "PAYMENT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if config.retry.attempt_lease <= config.gateway_timeout {
            return Err(LedgerError::Config(
                "PAYMENT_ATTEMPT_LEASE_SECS must exceed GATEWAY_TIMEOUT_MS".to_string(),
            ));
        }
        if config.db_max_connections == 0 {
            return Err(LedgerError::Config(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| LedgerError::Config(format!("Missing env var: {key}")))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| LedgerError::Config(format!("Invalid {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            attempt_lease: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(40), Duration::from_millis(500));
    }
}
