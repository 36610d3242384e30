//! Configuration module for the realm-gate server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::{EncodingKind, MAX_FRAME_SIZE};
use crate::dispatch::DispatchSettings;
use crate::net::{OversizePolicy, SendLimits};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "realm-gate")]
#[command(version)]
#[command(about = "Transport core for a persistent-world game server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:10300)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of simultaneous client connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Registry capacity; accepts beyond it are dropped
    pub max_connections: usize,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10300".to_string(),
            workers: None,
            max_connections: 10_000,
            backlog: 100,
        }
    }
}

/// Socket and buffer configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Size of each pooled receive/send buffer
    pub buffer_size: usize,
    /// Buffers preallocated in the pool (two per connection)
    pub pool_buffers: usize,
    /// SO_SNDBUF for accepted sockets
    pub socket_send_buffer: usize,
    /// SO_RCVBUF for accepted sockets
    pub socket_recv_buffer: usize,
    /// TCP_NODELAY for accepted sockets
    pub nodelay: bool,
    /// Largest frame a handler may send
    pub max_packet_size: usize,
    /// What to do with frames over `max_packet_size`
    pub oversize_policy: OversizePolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            pool_buffers: 2048,
            socket_send_buffer: 16 * 1024,
            socket_recv_buffer: 16 * 1024,
            nodelay: true,
            max_packet_size: MAX_FRAME_SIZE,
            oversize_policy: OversizePolicy::Drop,
        }
    }
}

/// Handler timing configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Handlers slower than this are logged
    pub slow_handler_ms: u64,
    /// Handlers running longer than this are reported while still running
    /// (0 = disabled)
    pub watchdog_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            slow_handler_ms: 1000,
            watchdog_ms: 10_000,
        }
    }
}

/// Session lifetime configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Disconnect clients without a ping for this long (0 = never)
    pub idle_timeout_secs: u64,
    /// How long a link-dead player is kept before being torn down
    pub linkdead_grace_secs: u64,
    /// Interval of the idle/link-dead sweeper
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            linkdead_grace_secs: 60,
            sweep_interval_secs: 5,
        }
    }
}

/// Built-in protocol configuration
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Payload encoding negotiated by the modern client version
    pub encoding: EncodingKind,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub backlog: u32,
    pub buffer_size: usize,
    pub pool_buffers: usize,
    pub socket_send_buffer: usize,
    pub socket_recv_buffer: usize,
    pub nodelay: bool,
    pub max_packet_size: usize,
    pub oversize_policy: OversizePolicy,
    pub slow_handler: Duration,
    pub watchdog: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub linkdead_grace: Duration,
    pub sweep_interval: Duration,
    pub encoding: EncodingKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            network,
            dispatch,
            session,
            protocol,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            backlog: server.backlog,
            buffer_size: network.buffer_size,
            pool_buffers: network.pool_buffers,
            socket_send_buffer: network.socket_send_buffer,
            socket_recv_buffer: network.socket_recv_buffer,
            nodelay: network.nodelay,
            max_packet_size: network.max_packet_size,
            oversize_policy: network.oversize_policy,
            slow_handler: Duration::from_millis(dispatch.slow_handler_ms),
            watchdog: (dispatch.watchdog_ms > 0)
                .then(|| Duration::from_millis(dispatch.watchdog_ms)),
            idle_timeout: (session.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(session.idle_timeout_secs)),
            linkdead_grace: Duration::from_secs(session.linkdead_grace_secs),
            sweep_interval: Duration::from_secs(session.sweep_interval_secs),
            encoding: protocol.encoding,
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers must be at least 1"));
        }
        if self.buffer_size < MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid(
                "network.buffer_size must hold at least one maximum-size frame",
            ));
        }
        if self.max_packet_size > MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid(
                "network.max_packet_size cannot exceed the wire frame limit",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("session.sweep_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// The listen address as a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            slow_handler: self.slow_handler,
            watchdog: self.watchdog,
        }
    }

    pub fn send_limits(&self) -> SendLimits {
        SendLimits {
            max_packet_size: self.max_packet_size,
            oversize_policy: self.oversize_policy,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
