//! Configuration module for tuned-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither,
//! the server listens on port 8080 and the client sends five messages to
//! `localhost:8080` one second apart.

use crate::tuning::{
    ConnectionOptions, DEFAULT_BUFFER_SIZE, DEFAULT_KEEPALIVE_IDLE, DEFAULT_LINGER,
    DEFAULT_READ_TIMEOUT,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tuned-echo")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server and client with tuned socket options", long_about = None)]
pub struct CliArgs {
    /// `client` runs the client; anything else (or nothing) runs the server
    pub mode: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind (server) or connect to (client)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of messages the client sends before quitting
    #[arg(short = 'n', long)]
    pub messages: Option<usize>,

    /// Pause between client messages in milliseconds
    #[arg(long)]
    pub pause_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which side of the connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

impl Mode {
    fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            Some("client") => Mode::Client,
            _ => Mode::Server,
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub socket: SocketSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
        }
    }
}

/// `[client]` table
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_messages")]
    pub messages: usize,
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            messages: default_messages(),
            pause_ms: default_pause_ms(),
        }
    }
}

/// `[socket]` table. Zero disables the optional timeouts.
#[derive(Debug, Deserialize)]
pub struct SocketSection {
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            nodelay: true,
            send_buffer_size: default_buffer_size(),
            recv_buffer_size: default_buffer_size(),
            keepalive: true,
            keepalive_idle_secs: default_keepalive_idle_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_read_timeout_ms(),
            linger_secs: default_linger_secs(),
            reuse_address: true,
        }
    }
}

impl SocketSection {
    fn into_options(self) -> ConnectionOptions {
        fn nonzero(d: Duration) -> Option<Duration> {
            (!d.is_zero()).then_some(d)
        }

        ConnectionOptions {
            nodelay: self.nodelay,
            send_buffer_size: self.send_buffer_size,
            recv_buffer_size: self.recv_buffer_size,
            keepalive: self.keepalive,
            keepalive_idle: nonzero(Duration::from_secs(self.keepalive_idle_secs)),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: nonzero(Duration::from_millis(self.write_timeout_ms)),
            linger: nonzero(Duration::from_secs(self.linger_secs)),
            reuse_address: self.reuse_address,
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

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_messages() -> usize {
    5
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_keepalive_idle_secs() -> u64 {
    DEFAULT_KEEPALIVE_IDLE.as_secs()
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

fn default_linger_secs() -> u64 {
    DEFAULT_LINGER.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub messages: usize,
    pub pause: Duration,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub socket: ConnectionOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            mode: Mode::from_arg(cli.mode.as_deref()),
            server: ServerConfig {
                host: cli.host.clone().unwrap_or(toml_config.server.host),
                port: cli.port.unwrap_or(toml_config.server.port),
            },
            client: ClientConfig {
                host: cli.host.unwrap_or(toml_config.client.host),
                port: cli.port.unwrap_or(toml_config.client.port),
                messages: cli.messages.unwrap_or(toml_config.client.messages),
                pause: Duration::from_millis(cli.pause_ms.unwrap_or(toml_config.client.pause_ms)),
            },
            socket: toml_config.socket.into_options(),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.port == 0 {
            return Err(ConfigError::Invalid("client port must be non-zero".into()));
        }
        if self.client.messages == 0 {
            return Err(ConfigError::Invalid("messages must be at least 1".into()));
        }
        if self.socket.send_buffer_size == 0 || self.socket.recv_buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        if self.socket.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("read timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["tuned-echo"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.client.host, "localhost");
        assert_eq!(config.client.port, 8080);
        assert_eq!(config.client.messages, 5);
        assert_eq!(config.client.pause, Duration::from_millis(1000));
        assert_eq!(config.socket, ConnectionOptions::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(parse(&["client"]).unwrap().mode, Mode::Client);
        assert_eq!(parse(&["server"]).unwrap().mode, Mode::Server);
        assert_eq!(parse(&["anything"]).unwrap().mode, Mode::Server);
        assert_eq!(parse(&["CLIENT"]).unwrap().mode, Mode::Server);
    }

    #[test]
    fn test_cli_overrides() {
        let config = parse(&["client", "--host", "10.0.0.1", "-p", "9000", "-n", "3", "--pause-ms", "0"])
            .unwrap();
        assert_eq!(config.client.host, "10.0.0.1");
        assert_eq!(config.client.port, 9000);
        assert_eq!(config.client.messages, 3);
        assert_eq!(config.client.pause, Duration::ZERO);
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_zero_messages_rejected() {
        assert!(matches!(
            parse(&["client", "-n", "0"]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            parse(&["--config", "/nonexistent/tuned-echo.toml"]),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9090

            [client]
            messages = 10
            pause_ms = 250

            [socket]
            send_buffer_size = 131072
            keepalive = false
            linger_secs = 0
            write_timeout_ms = 0

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.client.host, "localhost");
        assert_eq!(config.client.messages, 10);
        assert_eq!(config.client.pause_ms, 250);
        assert_eq!(config.logging.level, "debug");

        let options = config.socket.into_options();
        assert_eq!(options.send_buffer_size, 131072);
        assert_eq!(options.recv_buffer_size, 65536);
        assert!(!options.keepalive);
        assert_eq!(options.linger, None);
        assert_eq!(options.write_timeout, None);
        assert_eq!(options.read_timeout, Duration::from_secs(30));
    }
}
