//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER;
use crate::relay::ConnectionString;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// What to tunnel, and through which relay
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Outbound client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// Target base URL every relayed request is forwarded to
    pub target: Option<String>,

    /// Relay connection string
    pub connection_string: Option<String>,
}

/// Outbound client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Connect timeout in seconds; 0 disables it
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Path to PEM CA certificates trusted for https targets, on top of the
    /// bundled web roots
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            tls_ca: None,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print a line per tunneled request
    #[serde(default = "default_true")]
    pub log_requests: bool,

    /// Capacity of the tunnel event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values that TOML alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(target) = &self.tunnel.target {
            parse_target(target)?;
        }
        if let Some(connection_string) = &self.tunnel.connection_string {
            ConnectionString::parse(connection_string)
                .map_err(|e| Error::config(format!("tunnel.connection_string: {}", e)))?;
        }
        if self.logging.event_buffer == 0 {
            return Err(Error::config("logging.event_buffer must be greater than 0"));
        }
        Ok(())
    }

    /// Replace file values with the ones given on the command line.
    pub fn apply_overrides(&mut self, target: Option<String>, connection_string: Option<String>) {
        if target.is_some() {
            self.tunnel.target = target;
        }
        if connection_string.is_some() {
            self.tunnel.connection_string = connection_string;
        }
    }

    /// The target base URL; required to run.
    pub fn target(&self) -> Result<Url> {
        let target = self
            .tunnel
            .target
            .as_deref()
            .ok_or_else(|| Error::config("tunnel.target is not set"))?;
        parse_target(target)
    }

    /// The relay connection string; required to run.
    pub fn connection_string(&self) -> Result<ConnectionString> {
        let raw = self
            .tunnel
            .connection_string
            .as_deref()
            .ok_or_else(|| Error::config("tunnel.connection_string is not set"))?;
        ConnectionString::parse(raw)
            .map_err(|e| Error::config(format!("tunnel.connection_string: {}", e)))
    }

    /// Create a configuration with just the two required values
    pub fn minimal(target: String, connection_string: String) -> Self {
        Self {
            tunnel: TunnelConfig {
                target: Some(target),
                connection_string: Some(connection_string),
            },
            ..Self::default()
        }
    }
}

/// Parse a target base URL, accepting only absolute http(s) URLs.
pub fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::config(format!("tunnel.target {:?} is not a valid URL: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(Error::config(format!(
            "tunnel.target {:?} must be an absolute http or https URL",
            raw
        ))),
    }
}
