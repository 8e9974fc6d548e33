//! Configuration for the netcheck daemon.
//!
//! A TOML file layered with `NETCHECK_*` environment variables, validated
//! and translated into `netcheck_core::DaemonConfig`. Durations are given
//! in seconds and may be fractional.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use netcheck_core::DaemonConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netcheck/netcheck.toml";
pub const ENV_PREFIX: &str = "NETCHECK_";
pub const DEFAULT_SPOOL_DIR: &str = "/run/netcheck/gateway-changed";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file {} not found", path.display())]
    Missing { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// The configuration file as written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileConfig {
    /// Connection profile ids, best first.
    pub connection_ids: Vec<String>,
    pub nameservers: Vec<IpAddr>,
    pub dns_queries: Vec<String>,
    pub dns_timeout: f64,
    pub connection_activation_timeout: f64,
    pub connection_periodic_check_time: f64,
    pub available_connections_check_delay: f64,
    #[serde(default)]
    pub required_usage_connection_ids: Vec<String>,
    pub required_usage_max_delay: f64,
    pub required_usage_failed_retry_delay: f64,
    pub main_loop_delay: f64,
    pub periodic_status_delay: f64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_spool_dir")]
    pub gateway_spool_dir: PathBuf,
}

/// Defaults for the optional keys, merged under the file.
#[derive(Debug, Serialize)]
struct Defaults {
    required_usage_connection_ids: Vec<String>,
    log_level: String,
    gateway_spool_dir: PathBuf,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            required_usage_connection_ids: Vec::new(),
            log_level: default_log_level(),
            gateway_spool_dir: default_spool_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_spool_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOL_DIR)
}

// ── Validated settings ──────────────────────────────────────────────

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Everything the daemon binary needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
    pub gateway_spool_dir: PathBuf,
}

impl FileConfig {
    /// Check bounds and build the runtime configuration.
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let level = self.log_level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "log_level",
                format!("{} is not one of {}", self.log_level, LOG_LEVELS.join(", ")),
            ));
        }

        let daemon = DaemonConfig {
            dns_timeout: seconds("dns_timeout", self.dns_timeout)?,
            connection_activation_timeout: seconds(
                "connection_activation_timeout",
                self.connection_activation_timeout,
            )?,
            connection_periodic_check_time: seconds(
                "connection_periodic_check_time",
                self.connection_periodic_check_time,
            )?,
            available_connections_check_delay: seconds(
                "available_connections_check_delay",
                self.available_connections_check_delay,
            )?,
            required_usage_max_delay: seconds("required_usage_max_delay", self.required_usage_max_delay)?,
            required_usage_failed_retry_delay: seconds(
                "required_usage_failed_retry_delay",
                self.required_usage_failed_retry_delay,
            )?,
            main_loop_delay: seconds("main_loop_delay", self.main_loop_delay)?,
            periodic_status_delay: seconds("periodic_status_delay", self.periodic_status_delay)?,
            connection_ids: self.connection_ids,
            required_usage_connection_ids: self.required_usage_connection_ids,
            nameservers: self.nameservers,
            dns_queries: self.dns_queries,
        };
        daemon
            .validate()
            .map_err(|err| invalid("configuration", err.to_string()))?;

        Ok(Settings {
            daemon,
            logging: LoggingConfig {
                level,
                file: self.log_file,
            },
            gateway_spool_dir: self.gateway_spool_dir,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| invalid(field, format!("{value} is not a duration in seconds")))
}

// ── Config loading ──────────────────────────────────────────────────

/// The figment for `path`: defaults, then the file, then the environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Defaults::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
}

/// Load the raw file configuration with environment overrides.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Missing {
            path: path.to_path_buf(),
        });
    }
    Ok(figment(path).extract()?)
}

/// Load and validate.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    load_file_config(path)?.into_settings()
}
