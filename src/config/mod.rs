//! Configuration Module
//!
//! Server settings come from command-line flags and an optional TOML file.
//! Flags take precedence over the file, the file over built-in defaults.
//!
//! ```toml
//! [server]
//! address = "0.0.0.0:6399"
//! max_connections = 1024
//! idle_timeout = 300        # seconds, 0 disables
//!
//! [logging]
//! level = "debug"
//! ```

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bind address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6399";

/// Default advisory connection limit
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1024;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "gracetcp")]
#[command(version)]
#[command(about = "A line-echo TCP server with graceful shutdown", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6399)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Advisory connection limit (not enforced)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_connections: default_max_connections(),
            idle_timeout: 0,
        }
    }
}

/// `[logging]` table
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration. Immutable once the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `host:port` to bind
    pub address: String,
    /// Advisory only; the server never enforces it
    pub max_connections: u32,
    /// Zero disables the idle timeout
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Loads configuration from the process arguments and the optional
    /// TOML file they name.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolves parsed arguments, reading the TOML file if one is given.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config {
            Some(ref path) => Self::read_file(path)?,
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, file);
        validate_address(&config.address)?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<TomlConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            address: cli.listen.unwrap_or(file.server.address),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(file.server.idle_timeout),
            ),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }
}

/// Checks that `address` has `host:port` shape with a numeric port.
fn validate_address(address: &str) -> Result<(), ConfigError> {
    let valid = address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidAddress(address.to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid listen address '{0}', expected host:port")]
    InvalidAddress(String),
}
