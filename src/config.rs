//! Configuration module for the emberweb server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(name = "emberweb")]
#[command(version = "0.1.0")]
#[command(about = "An embeddable HTTP/1.1 server engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Document root for the static file handler
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Document root for the static file handler
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum concurrent connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            root: default_root(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Request/pipeline size limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accumulated header block size in bytes
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Maximum request-URI length in bytes
    #[serde(default = "default_max_uri_size")]
    pub max_uri_size: usize,
    /// Maximum declared request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// Per-queue buffered byte capacity
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    /// Preferred packet fragment size
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            max_uri_size: default_max_uri_size(),
            max_body_size: default_max_body_size(),
            queue_max: default_queue_max(),
            packet_size: default_packet_size(),
        }
    }
}

/// Connection timeout configuration (seconds)
#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    /// Inactivity timeout while a request is in flight
    #[serde(default = "default_inactivity")]
    pub inactivity: u64,
    /// Idle timeout between keep-alive requests
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Maximum requests served per connection
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            inactivity: default_inactivity(),
            keep_alive: default_keep_alive(),
            max_keep_alive: default_max_keep_alive(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_header_size() -> usize {
    16 * 1024
}

fn default_max_uri_size() -> usize {
    4 * 1024
}

fn default_max_body_size() -> u64 {
    16 * 1024 * 1024
}

fn default_queue_max() -> usize {
    64 * 1024
}

fn default_packet_size() -> usize {
    16 * 1024
}

fn default_inactivity() -> u64 {
    60
}

fn default_keep_alive() -> u64 {
    5
}

fn default_max_keep_alive() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved size limits handed to the parser and pipeline.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_header_size: usize,
    pub max_uri_size: usize,
    pub max_body_size: u64,
    pub queue_max: usize,
    pub packet_size: usize,
}

/// Resolved connection timeouts.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub inactivity: Duration,
    pub keep_alive: Duration,
    pub max_keep_alive: u32,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub root: PathBuf,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            root: cli.root.unwrap_or(toml_config.server.root),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            limits: Limits {
                max_header_size: toml_config.limits.max_header_size,
                max_uri_size: toml_config.limits.max_uri_size,
                max_body_size: toml_config.limits.max_body_size,
                queue_max: toml_config.limits.queue_max,
                packet_size: toml_config.limits.packet_size,
            },
            timeouts: Timeouts {
                inactivity: Duration::from_secs(toml_config.timeouts.inactivity),
                keep_alive: Duration::from_secs(toml_config.timeouts.keep_alive),
                max_keep_alive: toml_config.timeouts.max_keep_alive,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Config {
            listen: toml.server.listen,
            root: toml.server.root,
            workers: None,
            max_connections: toml.server.max_connections,
            limits: Limits {
                max_header_size: toml.limits.max_header_size,
                max_uri_size: toml.limits.max_uri_size,
                max_body_size: toml.limits.max_body_size,
                queue_max: toml.limits.queue_max,
                packet_size: toml.limits.packet_size,
            },
            timeouts: Timeouts {
                inactivity: Duration::from_secs(toml.timeouts.inactivity),
                keep_alive: Duration::from_secs(toml.timeouts.keep_alive),
                max_keep_alive: toml.timeouts.max_keep_alive,
            },
            log_level: toml.logging.level,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
