//! Process configuration
//!
//! Defaults, overlaid by an optional YAML file named in `PINGBRIDGE_CONFIG`,
//! overlaid by individual `PINGBRIDGE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_FILE_ENV: &str = "PINGBRIDGE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid duration {value:?} for {field}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid boolean {value:?} for {field}")]
    InvalidBool { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address for inbound HTTP/WebSocket traffic
    pub listen_addr: String,
    /// UDP address heartbeats arrive on
    pub ping_addr: String,
    /// How long a route lives without a fresh heartbeat
    pub ping_timeout: Duration,
    /// Hostname suffixes allowed to route; empty allows all
    pub whitelist_suffixes: Vec<String>,
    /// Longest silence tolerated on a proxied connection
    pub idle_timeout: Duration,
    /// Deadline for dialing a backend, TLS handshake included
    pub connect_timeout: Duration,
    /// Accept any certificate from TLS backends
    pub tls_skip_verify: bool,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            ping_addr: "0.0.0.0:4445".to_string(),
            ping_timeout: Duration::from_secs(30),
            whitelist_suffixes: Vec::new(),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            tls_skip_verify: false,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    ping_addr: Option<String>,
    ping_timeout: Option<String>,
    whitelist_suffixes: Option<Vec<String>>,
    idle_timeout: Option<String>,
    connect_timeout: Option<String>,
    tls_skip_verify: Option<bool>,
    log_level: Option<String>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(path) = lookup(CONFIG_FILE_ENV) {
            cfg.apply_file(FileConfig::read(Path::new(&path))?)?;
        }

        if let Some(v) = lookup("PINGBRIDGE_LISTEN") {
            cfg.listen_addr = v;
        }
        if let Some(v) = lookup("PINGBRIDGE_PING_ADDR") {
            cfg.ping_addr = v;
        }
        if let Some(v) = lookup("PINGBRIDGE_PING_TIMEOUT") {
            cfg.ping_timeout = duration_field("ping_timeout", &v)?;
        }
        if let Some(v) = lookup("PINGBRIDGE_WHITELIST") {
            cfg.whitelist_suffixes = v.split(',').map(str::to_string).collect();
        }
        if let Some(v) = lookup("PINGBRIDGE_IDLE_TIMEOUT") {
            cfg.idle_timeout = duration_field("idle_timeout", &v)?;
        }
        if let Some(v) = lookup("PINGBRIDGE_CONNECT_TIMEOUT") {
            cfg.connect_timeout = duration_field("connect_timeout", &v)?;
        }
        if let Some(v) = lookup("PINGBRIDGE_TLS_SKIP_VERIFY") {
            cfg.tls_skip_verify = bool_field("tls_skip_verify", &v)?;
        }
        if let Some(v) = lookup("PINGBRIDGE_LOG") {
            cfg.log_level = v;
        }

        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = file.ping_addr {
            self.ping_addr = v;
        }
        if let Some(v) = file.ping_timeout {
            self.ping_timeout = duration_field("ping_timeout", &v)?;
        }
        if let Some(v) = file.whitelist_suffixes {
            self.whitelist_suffixes = v;
        }
        if let Some(v) = file.idle_timeout {
            self.idle_timeout = duration_field("idle_timeout", &v)?;
        }
        if let Some(v) = file.connect_timeout {
            self.connect_timeout = duration_field("connect_timeout", &v)?;
        }
        if let Some(v) = file.tls_skip_verify {
            self.tls_skip_verify = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.whitelist_suffixes = self
            .whitelist_suffixes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("ping_timeout"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_timeout"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connect_timeout"));
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

fn bool_field(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

/// Parse a duration like `500ms`, `30s`, `5m`, `1h` or `3m5s`.
///
/// Every number needs a unit.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }

    Some(total)
}
