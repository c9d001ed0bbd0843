use std::path::PathBuf;
use std::time::Duration;

use crate::locks::DEFAULT_LOCK_TTL;
use crate::tenant::{Locale, Timezone};

/// Daemon settings, read from `LESSOND_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_ttl: Duration,
    pub lock_sweep_interval: Duration,
    pub default_timezone: Timezone,
    pub default_locale: Locale,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Shared lock store; only honoured with the `redis-locks` feature.
    pub redis_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
            }
        }

        let lock_ttl_secs = parsed(&lookup, "LESSOND_LOCK_TTL_SECS", DEFAULT_LOCK_TTL.as_secs())?;
        if lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "LESSOND_LOCK_TTL_SECS",
                value: "0".into(),
            });
        }
        let default_locale = match lookup("LESSOND_DEFAULT_LOCALE") {
            None => Locale::default(),
            Some(tag) => Locale::from_tag(&tag).ok_or(ConfigError::Invalid {
                var: "LESSOND_DEFAULT_LOCALE",
                value: tag,
            })?,
        };
        let metrics_port = match lookup("LESSOND_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "LESSOND_METRICS_PORT",
                value,
            })?),
        };

        Ok(Self {
            port: parsed(&lookup, "LESSOND_PORT", 5433)?,
            bind: lookup("LESSOND_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("LESSOND_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("LESSOND_PASSWORD").unwrap_or_else(|| "lessond".into()),
            max_connections: parsed(&lookup, "LESSOND_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed(&lookup, "LESSOND_COMPACT_THRESHOLD", 1000)?,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            lock_sweep_interval: Duration::from_secs(parsed(&lookup, "LESSOND_LOCK_SWEEP_SECS", 30)?),
            default_timezone: parsed(&lookup, "LESSOND_DEFAULT_TIMEZONE", Timezone::utc())?,
            default_locale,
            metrics_port,
            tls_cert: lookup("LESSOND_TLS_CERT"),
            tls_key: lookup("LESSOND_TLS_KEY"),
            redis_url: lookup("LESSOND_REDIS_URL"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
