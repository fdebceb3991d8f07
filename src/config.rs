use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::{DAY_MS, Ms};
use crate::tenant::TenantSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration, read from `HOLDFAST_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    pub retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            store_timeout: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(60),
            retention_days: 30,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key → value source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            bind: lookup("HOLDFAST_BIND").unwrap_or(d.bind),
            port: parse(&lookup, "HOLDFAST_PORT")?.unwrap_or(d.port),
            data_dir: lookup("HOLDFAST_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: parse(&lookup, "HOLDFAST_METRICS_PORT")?,
            compact_threshold: parse(&lookup, "HOLDFAST_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            store_timeout: parse(&lookup, "HOLDFAST_STORE_TIMEOUT_MS")?
                .map_or(d.store_timeout, Duration::from_millis),
            sweep_interval: parse(&lookup, "HOLDFAST_SWEEP_INTERVAL_SECS")?
                .map_or(d.sweep_interval, Duration::from_secs),
            retention_days: parse(&lookup, "HOLDFAST_RETENTION_DAYS")?.unwrap_or(d.retention_days),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            store_timeout: self.store_timeout,
            sweep_interval: self.sweep_interval,
            retention: Ms::from(self.retention_days) * DAY_MS,
        }
    }
}
