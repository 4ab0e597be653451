//! Configuration system for the Huddle relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/huddle-relay/config.toml`)
//! 4. Compiled defaults
//!
//! A numeric limit of zero at any layer means "not set" and falls through to
//! the next layer.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    limits: LimitsFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    ws_path: Option<String>,
    echo_to_sender: Option<bool>,
    join_timeout_secs: Option<u64>,
}

/// `[limits]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LimitsFileConfig {
    max_peers_per_channel: Option<usize>,
    connection_limit_per_minute: Option<u32>,
    message_limit_per_second: Option<u32>,
    max_frame_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Huddle rendezvous relay")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/huddle-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path that accepts WebSocket upgrades.
    #[arg(long, env = "WS_PATH")]
    pub ws_path: Option<String>,

    /// Maximum members per channel.
    #[arg(long, env = "MAX_PEERS_PER_CHANNEL")]
    pub max_peers_per_channel: Option<usize>,

    /// New connections admitted per IP per minute.
    #[arg(long, env = "WS_CONN_PER_MIN")]
    pub connection_limit_per_minute: Option<u32>,

    /// Frames admitted per IP per channel per second.
    #[arg(long, env = "WS_MSG_PER_SEC")]
    pub message_limit_per_second: Option<u32>,

    /// Largest frame the relay will forward, in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Seconds a new connection may take to send its join.
    #[arg(long, env = "JOIN_TIMEOUT_SECS")]
    pub join_timeout_secs: Option<u64>,

    /// Do not send broadcast frames back to their sender.
    #[arg(long)]
    pub no_echo: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:3000`).
    pub bind_addr: String,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Member cap per channel.
    pub max_peers_per_channel: Option<usize>,
    /// Per-IP connection limit per minute; `None` is unlimited.
    pub connection_limit_per_minute: Option<u32>,
    /// Per-IP-and-channel frame limit per second; `None` is unlimited.
    pub message_limit_per_second: Option<u32>,
    /// Whether broadcasts are echoed to the sending connection.
    pub echo_to_sender: bool,
    /// Largest forwarded frame in bytes.
    pub max_frame_size: usize,
    /// Time a connection may stay unjoined before it is closed with 4000.
    pub join_timeout: Duration,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            ws_path: "/ws".to_string(),
            max_peers_per_channel: Some(6),
            connection_limit_per_minute: None,
            message_limit_per_second: None,
            echo_to_sender: true,
            max_frame_size: 64 * 1024,
            join_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Window of the connection limiter.
    pub const CONNECTION_WINDOW: Duration = Duration::from_secs(60);
    /// Window of the message limiter.
    pub const MESSAGE_WINDOW: Duration = Duration::from_secs(1);

    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            ws_path: cli
                .ws_path
                .clone()
                .or_else(|| file.server.ws_path.clone())
                .filter(|p| !p.is_empty())
                .map_or(defaults.ws_path, |p| normalize_path(&p)),
            max_peers_per_channel: non_zero(cli.max_peers_per_channel)
                .or_else(|| non_zero(file.limits.max_peers_per_channel))
                .or(defaults.max_peers_per_channel),
            connection_limit_per_minute: non_zero(cli.connection_limit_per_minute)
                .or_else(|| non_zero(file.limits.connection_limit_per_minute)),
            message_limit_per_second: non_zero(cli.message_limit_per_second)
                .or_else(|| non_zero(file.limits.message_limit_per_second)),
            echo_to_sender: !cli.no_echo
                && file.server.echo_to_sender.unwrap_or(defaults.echo_to_sender),
            max_frame_size: non_zero(cli.max_frame_size)
                .or_else(|| non_zero(file.limits.max_frame_size))
                .unwrap_or(defaults.max_frame_size),
            join_timeout: non_zero(cli.join_timeout_secs)
                .or_else(|| non_zero(file.server.join_timeout_secs))
                .map_or(defaults.join_timeout, Duration::from_secs),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Treats zero as absent.
fn non_zero<T: Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

/// Ensures the WebSocket path starts with `/`.
fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("huddle-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
