//! Configuration management for errorrelay
//!
//! Handles loading and validation of `errorrelay.toml`. Every section is
//! optional; missing keys fall back to the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Well-known port shared by the reporting client and the relay.
pub const DEFAULT_PORT: u16 = 9277;

/// Environment variable overriding `relay.port`.
pub const ENV_PORT: &str = "ERRORRELAY_PORT";
/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "ERRORRELAY_LOG_LEVEL";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Inbound report channel
    pub relay: RelayConfig,
    /// Startup port arbitration
    pub arbiter: ArbiterConfig,
    /// Logging
    pub logging: LogConfig,
}

/// Inbound report channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface to bind
    pub host: IpAddr,
    /// Port shared with the reporting client
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Port arbitration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Run arbitration before binding
    pub enabled: bool,
    /// Process names treated as prior relay instances (substring match)
    pub compatible_process_names: Vec<String>,
    /// Wait after a successful takeover so the kernel releases the socket
    pub grace_ms: u64,
    /// How long to wait for a killed process to exit
    pub exit_timeout_ms: u64,
    /// Poll interval while waiting for exit
    pub exit_poll_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compatible_process_names: vec!["errorrelay".to_string()],
            grace_ms: 500,
            exit_timeout_ms: 2_000,
            exit_poll_ms: 50,
        }
    }
}

impl ArbiterConfig {
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    #[must_use]
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    #[must_use]
    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms.max(1))
    }
}

impl Config {
    /// Default config file location (`$XDG_CONFIG_HOME/errorrelay/errorrelay.toml`).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("errorrelay").join("errorrelay.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// when present and built-in defaults otherwise. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.display().to_string()).into());
                }
                Self::load_from(path)?
            }
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::load_from(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path, without env overrides.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_toml(&raw)?)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `ERRORRELAY_*` overrides using the supplied lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.relay.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{ENV_PORT}={port} is not a valid port"))
            })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.port == 0 {
            return Err(ConfigError::ValidationError(
                "relay.port must be non-zero".to_string(),
            ));
        }
        if self.arbiter.enabled
            && self
                .arbiter
                .compatible_process_names
                .iter()
                .all(|name| name.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "arbiter.compatible_process_names must name at least one process".to_string(),
            ));
        }
        Ok(())
    }
}
