//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on invalid values. The API token is
//! wrapped in `secrecy::SecretString` so it never reaches the logs.

use crate::controller::MAX_RETRIES;
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RESYNC_SECS: u64 = 30;

#[derive(Debug)]
pub struct Config {
    /// Concurrent reconcile workers, at least 1.
    pub workers: usize,
    /// Period of the cache's full relist, greater than zero.
    pub resync_interval: Duration,
    pub max_retries: u32,
    /// Resource API location. Opaque to the controller.
    pub api_endpoint: Option<String>,
    pub api_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            workers: parsed_var("WORKERS", 1)?,
            resync_interval: Duration::from_secs(parsed_var(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_SECS,
            )?),
            max_retries: parsed_var("MAX_RETRIES", MAX_RETRIES)?,
            api_endpoint: std::env::var("API_ENDPOINT").ok(),
            api_token: std::env::var("API_TOKEN").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("WORKERS must be at least 1".to_string()));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::Config(
                "RESYNC_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
