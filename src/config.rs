use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use crate::rate_limit::LimiterConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub env: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout: Duration,
    pub limiter: LimiterConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing {
                key: "DATABASE_URL",
            })?;

        let rps: f64 = try_load(&lookup, "LIMITER_RPS", "2")?;
        if !(rps > 0.0 && rps.is_finite()) {
            return Err(ConfigError::Invalid {
                key: "LIMITER_RPS",
                value: rps.to_string(),
                reason: "must be a positive number".into(),
            });
        }

        let db_timeout_secs: u64 = try_load(&lookup, "DB_TIMEOUT_SECS", "3")?;

        Ok(Self {
            port: try_load(&lookup, "SERVER_PORT", "4000")?,
            env: try_load(&lookup, "SERVER_ENV", "development")?,
            database_url,
            db_max_connections: try_load(&lookup, "DB_MAX_CONNECTIONS", "5")?,
            db_timeout: Duration::from_secs(db_timeout_secs.max(1)),
            limiter: LimiterConfig {
                rps,
                burst: try_load(&lookup, "LIMITER_BURST", "4")?,
                enabled: try_load(&lookup, "LIMITER_ENABLED", "true")?,
            },
        })
    }
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }
    })
}
