use std::time::Duration;

use lookout_model::DEFAULT_CHECK_TIMEOUT;
use lookout_pacing::{
    MaxChecksPerSecond, DEFAULT_CHECKER_INTERVAL, DEFAULT_RESOURCE_CHECKING_INTERVAL,
    DEFAULT_SCANNER_INTERVAL,
};
use thiserror::Error;

use crate::db::DbConfig;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("invalid {var}='{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which check store backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreKind,
    pub database: DbConfig,
    pub max_checks_per_second: MaxChecksPerSecond,
    pub resource_checking_interval: Duration,
    pub resource_with_webhook_checking_interval: Duration,
    pub scanner_interval: Duration,
    pub checker_interval: Duration,
    pub rate_refresh_interval: Duration,
    pub global_resource_check_timeout: Duration,
    pub persist_checks: bool,
    pub executor_url: String,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let log_level = lookup("LOOKOUT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = flag(&lookup, "LOOKOUT_DEV", false)?;

        let store = match lookup("LOOKOUT_STORE").as_deref() {
            None | Some("postgres") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LOOKOUT_STORE",
                    value: other.to_string(),
                    reason: "expected 'postgres' or 'memory'".to_string(),
                })
            }
        };

        let max_checks_per_second = match lookup("LOOKOUT_MAX_CHECKS_PER_SECOND") {
            None => MaxChecksPerSecond::Auto,
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|e| e.to_string())
                .and_then(|n| MaxChecksPerSecond::try_from(n).map_err(|e| e.to_string()))
                .map_err(|reason| ConfigError::Invalid {
                    var: "LOOKOUT_MAX_CHECKS_PER_SECOND",
                    value: raw.clone(),
                    reason,
                })?,
        };

        let resource_checking_interval = duration(
            &lookup,
            "LOOKOUT_RESOURCE_CHECKING_INTERVAL",
            DEFAULT_RESOURCE_CHECKING_INTERVAL,
        )?;

        // A webhook default below the regular default would check webhook
        // resources more often than the rest.
        let resource_with_webhook_checking_interval = duration(
            &lookup,
            "LOOKOUT_RESOURCE_WITH_WEBHOOK_CHECKING_INTERVAL",
            DEFAULT_RESOURCE_CHECKING_INTERVAL,
        )?
        .max(resource_checking_interval);

        let scanner_interval = duration(&lookup, "LOOKOUT_SCANNER_INTERVAL", DEFAULT_SCANNER_INTERVAL)?;
        let checker_interval = duration(&lookup, "LOOKOUT_CHECKER_INTERVAL", DEFAULT_CHECKER_INTERVAL)?;
        let rate_refresh_interval = duration(
            &lookup,
            "LOOKOUT_RATE_REFRESH_INTERVAL",
            Duration::from_secs(60),
        )?;

        let global_resource_check_timeout = duration(
            &lookup,
            "LOOKOUT_GLOBAL_RESOURCE_CHECK_TIMEOUT",
            DEFAULT_CHECK_TIMEOUT,
        )?;

        let persist_checks = flag(&lookup, "LOOKOUT_PERSIST_CHECKS", true)?;

        let executor_url = lookup("LOOKOUT_EXECUTOR_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8081".to_string());

        let shutdown_timeout = duration(&lookup, "LOOKOUT_SHUTDOWN_TIMEOUT", Duration::from_secs(10))?;

        let database = DbConfig::from_lookup(&lookup);

        Ok(Self {
            log_level,
            dev_mode,
            store,
            database,
            max_checks_per_second,
            resource_checking_interval,
            resource_with_webhook_checking_interval,
            scanner_interval,
            checker_interval,
            rate_refresh_interval,
            global_resource_check_timeout,
            persist_checks,
            executor_url,
            shutdown_timeout,
        })
    }
}

impl Config {
    /// How long a claimed check stays with one instance. A minute longer than
    /// the check timeout, so a running check is never claimed twice.
    pub fn claim_lease(&self) -> Duration {
        self.global_resource_check_timeout + Duration::from_secs(60)
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn duration(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    let parsed = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;

    if parsed.is_zero() {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.store, StoreKind::Postgres);
        assert_eq!(config.max_checks_per_second, MaxChecksPerSecond::Auto);
        assert_eq!(config.resource_checking_interval, Duration::from_secs(60));
        assert_eq!(
            config.resource_with_webhook_checking_interval,
            Duration::from_secs(60)
        );
        assert_eq!(config.scanner_interval, Duration::from_secs(10));
        assert_eq!(config.checker_interval, Duration::from_secs(10));
        assert_eq!(config.global_resource_check_timeout, Duration::from_secs(3600));
        assert_eq!(config.claim_lease(), Duration::from_secs(3660));
        assert!(config.persist_checks);
        assert!(!config.dev_mode);
        assert_eq!(config.executor_url, "http://127.0.0.1:8081");
    }

    #[test]
    fn test_webhook_interval_raised_to_checking_interval() {
        let config = config(&[
            ("LOOKOUT_RESOURCE_CHECKING_INTERVAL", "5m"),
            ("LOOKOUT_RESOURCE_WITH_WEBHOOK_CHECKING_INTERVAL", "1m"),
        ])
        .unwrap();

        assert_eq!(
            config.resource_with_webhook_checking_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_webhook_interval_may_be_longer() {
        let config = config(&[("LOOKOUT_RESOURCE_WITH_WEBHOOK_CHECKING_INTERVAL", "24h")]).unwrap();

        assert_eq!(
            config.resource_with_webhook_checking_interval,
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn test_max_checks_per_second() {
        assert_eq!(
            config(&[("LOOKOUT_MAX_CHECKS_PER_SECOND", "-1")])
                .unwrap()
                .max_checks_per_second,
            MaxChecksPerSecond::Unlimited
        );
        assert_eq!(
            config(&[("LOOKOUT_MAX_CHECKS_PER_SECOND", "20")])
                .unwrap()
                .max_checks_per_second,
            MaxChecksPerSecond::Fixed(20)
        );

        let err = config(&[("LOOKOUT_MAX_CHECKS_PER_SECOND", "-5")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "LOOKOUT_MAX_CHECKS_PER_SECOND",
                ..
            }
        ));
    }

    #[rstest]
    #[case("LOOKOUT_SCANNER_INTERVAL", "soon")]
    #[case("LOOKOUT_CHECKER_INTERVAL", "0s")]
    #[case("LOOKOUT_RESOURCE_CHECKING_INTERVAL", "-1m")]
    #[case("LOOKOUT_STORE", "redis")]
    #[case("LOOKOUT_PERSIST_CHECKS", "maybe")]
    #[case("LOOKOUT_MAX_CHECKS_PER_SECOND", "fast")]
    #[case("LOOKOUT_GLOBAL_RESOURCE_CHECK_TIMEOUT", "0s")]
    fn test_invalid_values_rejected(#[case] var: &'static str, #[case] value: &str) {
        match config(&[(var, value)]) {
            Err(ConfigError::Invalid { var: bad, value: got, .. }) => {
                assert_eq!(bad, var);
                assert_eq!(got, value);
            }
            Ok(_) => panic!("{var}='{value}' was accepted"),
        }
    }

    #[test]
    fn test_global_resource_check_timeout() {
        let config = config(&[("LOOKOUT_GLOBAL_RESOURCE_CHECK_TIMEOUT", "10m")]).unwrap();

        assert_eq!(config.global_resource_check_timeout, Duration::from_secs(600));
        assert_eq!(config.claim_lease(), Duration::from_secs(660));
    }

    #[test]
    fn test_memory_store_and_ephemeral_checks() {
        let config = config(&[
            ("LOOKOUT_STORE", "memory"),
            ("LOOKOUT_PERSIST_CHECKS", "false"),
            ("LOOKOUT_DEV", "1"),
        ])
        .unwrap();

        assert_eq!(config.store, StoreKind::Memory);
        assert!(!config.persist_checks);
        assert!(config.dev_mode);
    }
}
