//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Debug session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the client reaches the server
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Bind a TCP listener and accept exactly one client
    #[default]
    Tcp,
    /// Speak DAP over the process' stdin/stdout
    Stdio,
}

/// Listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub mode: TransportMode,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Default TCP port of the debug server
pub const DEFAULT_PORT: u16 = 6612;

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// How long to wait for a client to connect
    #[serde(default = "default_wait_for_client")]
    pub wait_for_client_secs: f64,

    /// How long to wait for `configurationDone` after `initialized`
    #[serde(default = "default_configuration_done")]
    pub configuration_done_secs: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            wait_for_client_secs: default_wait_for_client(),
            configuration_done_secs: default_configuration_done(),
        }
    }
}

fn default_wait_for_client() -> f64 {
    5.0
}
fn default_configuration_done() -> f64 {
    5.0
}

/// Debug session switches
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SessionConfig {
    /// Stop at the first suite before running anything
    #[serde(default)]
    pub stop_on_entry: bool,
    /// Run without ever pausing
    #[serde(default)]
    pub no_debug: bool,
    /// Forward engine messages as `output` events
    #[serde(default)]
    pub output_messages: bool,
    /// Forward log messages as `output` events
    #[serde(default)]
    pub output_log: bool,
    /// Fold output of each unit into a collapsible group
    #[serde(default)]
    pub group_output: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Additional log file
    pub file: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: Option<String>,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

impl Timeouts {
    pub fn wait_for_client(&self) -> Result<Duration> {
        to_duration("wait_for_client_secs", self.wait_for_client_secs)
    }

    pub fn configuration_done(&self) -> Result<Duration> {
        to_duration("configuration_done_secs", self.configuration_done_secs)
    }
}

/// Negative values mean no wait, values too large for a `Duration` are rejected
fn to_duration(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_err(|e| Error::Config(format!("{} = {}: {}", name, secs, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.port, 6612);
        assert_eq!(config.server.mode, TransportMode::Tcp);
        assert_eq!(config.timeouts.wait_for_client_secs, 5.0);
        assert!(!config.session.no_debug);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
mode = "stdio"

[session]
stop_on_entry = true
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server.mode, TransportMode::Stdio);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.session.stop_on_entry);
        assert_eq!(config.timeouts.configuration_done_secs, 5.0);
    }

    #[test]
    fn test_malformed_file_is_config_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, super::super::Error::ConfigParse(_)));
    }

    #[test]
    fn test_timeouts_clamp_negative_and_reject_infinite() {
        let mut timeouts = Timeouts::default();
        timeouts.wait_for_client_secs = -3.0;
        assert_eq!(timeouts.wait_for_client().unwrap(), Duration::ZERO);

        timeouts.configuration_done_secs = f64::INFINITY;
        let err = timeouts.configuration_done().unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("configuration_done_secs")));
    }
}
