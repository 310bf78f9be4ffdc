//! Configuration management for the server.

use std::env;
use std::time::Duration;

use timetable_engine::{ResolverConfig, SessionConfig};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; documents stay in memory without one
    pub database_url: Option<String>,
    /// Site id this server stamps its own snapshots with
    pub site_id: String,
    pub idle_timeout: Duration,
    pub close_timeout: Duration,
    pub lock_timeout: Duration,
    /// How often the reaper sweeps sessions
    pub sweep_interval: Duration,
    pub max_resubmits: usize,
    /// Room catalogue and day end used for suggestions
    pub resolver: ResolverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            site_id: "server".to_string(),
            idle_timeout: Duration::from_secs(1800),
            close_timeout: Duration::from_secs(7200),
            lock_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_resubmits: 3,
            resolver: ResolverConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        let site_id = lookup("SITE_ID").unwrap_or(defaults.site_id);

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => value
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidNumber { var: key, value }),
                None => Ok(default),
            }
        };

        let idle_timeout = secs("SESSION_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?;
        let close_timeout = secs("SESSION_CLOSE_TIMEOUT_SECS", defaults.close_timeout)?;
        let lock_timeout = secs("LOCK_TIMEOUT_SECS", defaults.lock_timeout)?;
        let sweep_interval = secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?;

        if sweep_interval.is_zero() {
            return Err(ConfigError::InvalidNumber {
                var: "SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        if close_timeout <= idle_timeout {
            return Err(ConfigError::CloseBeforeIdle {
                idle_secs: idle_timeout.as_secs(),
                close_secs: close_timeout.as_secs(),
            });
        }

        let max_resubmits = match lookup("MAX_RESUBMITS") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidNumber {
                var: "MAX_RESUBMITS",
                value,
            })?,
            None => defaults.max_resubmits,
        };

        let rooms: Vec<String> = lookup("ROOMS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|room| !room.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut resolver = ResolverConfig::default().with_rooms(rooms);
        if let Some(day_end) = lookup("DAY_END") {
            resolver = resolver
                .with_day_end(&day_end)
                .map_err(|_| ConfigError::InvalidDayEnd(day_end))?;
        }

        Ok(Self {
            host,
            port,
            database_url,
            site_id,
            idle_timeout,
            close_timeout,
            lock_timeout,
            sweep_interval,
            max_resubmits,
            resolver,
        })
    }

    /// Engine settings for every session this server hosts.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout_ms: self.idle_timeout.as_millis() as u64,
            close_timeout_ms: self.close_timeout.as_millis() as u64,
            lock_ttl_ms: self.lock_timeout.as_millis() as u64,
            max_resubmits: self.max_resubmits,
            resolver: self.resolver.clone(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid DAY_END value: {0} (expected HH:MM)")]
    InvalidDayEnd(String),

    #[error("SESSION_CLOSE_TIMEOUT_SECS ({close_secs}) must exceed SESSION_IDLE_TIMEOUT_SECS ({idle_secs})")]
    CloseBeforeIdle { idle_secs: u64, close_secs: u64 },
}
