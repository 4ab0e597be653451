//! Configuration system for the Huddle client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/huddle/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_PEERS, DiscoveryConfig};
use crate::session::{DEFAULT_STATS_INTERVAL, SessionConfig};

/// STUN port the bootstrap host is expected to serve.
pub const BOOTSTRAP_STUN_PORT: u16 = 3478;

/// Public STUN server used as a fallback.
pub const FALLBACK_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Errors that can occur when loading configuration.
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

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    profile: ProfileFileConfig,
    network: NetworkFileConfig,
    log: LogFileConfig,
}

/// `[profile]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ProfileFileConfig {
    display_name: Option<String>,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    ice_servers: Option<Vec<String>>,
    heartbeat_interval_ms: Option<u64>,
    max_peers: Option<usize>,
    stats_interval_ms: Option<u64>,
}

/// `[log]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogFileConfig {
    level: Option<String>,
    file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// What the client should do.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a new room, print its invitation link, and join it.
    Create {
        /// Relay URL written into the invitation as the bootstrap address.
        #[arg(long, env = "HUDDLE_BOOTSTRAP")]
        bootstrap: String,

        /// Origin of the invitation link (default: the bootstrap URL).
        #[arg(long)]
        origin: Option<String>,
    },
    /// Join a room from an invitation link.
    Join {
        /// Invitation link or its `#g=...` fragment.
        link: String,
    },
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Small-group peer-to-peer encrypted chat")]
pub struct CliArgs {
    /// Action to take.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Name shown to other peers.
    #[arg(short, long, env = "HUDDLE_NAME")]
    pub name: Option<String>,

    /// Relay URL, overriding the invitation's bootstrap address.
    #[arg(long, env = "HUDDLE_RELAY_URL")]
    pub relay_url: Option<String>,

    /// ICE server URL (repeatable). Replaces the derived defaults.
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Maximum number of peers to connect to.
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Path to config file (default: `~/.config/huddle/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "HUDDLE_LOG")]
    pub log_level: Option<String>,

    /// Path to log file (default: `$TMPDIR/huddle.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name shown to other peers.
    pub display_name: String,
    /// Relay URL overriding the invitation's bootstrap address.
    pub relay_url: Option<String>,
    /// Explicit ICE servers; empty means derive from the bootstrap address.
    pub ice_servers: Vec<String>,
    /// Interval between descriptor heartbeats.
    pub heartbeat_interval: Duration,
    /// Maximum number of remote peers.
    pub max_peers: usize,
    /// Interval between link statistics snapshots.
    pub stats_interval: Duration,
    /// Log level filter string.
    pub log_level: String,
    /// Log file path.
    pub log_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: "Guest".to_string(),
            relay_url: None,
            ice_servers: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_peers: DEFAULT_MAX_PEERS,
            stats_interval: DEFAULT_STATS_INTERVAL,
            log_level: "info".to_string(),
            log_file: std::env::temp_dir().join("huddle.log"),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Zero intervals and peer caps count
    /// as unset.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            display_name: cli
                .name
                .clone()
                .or_else(|| file.profile.display_name.clone())
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.display_name),
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone()),
            ice_servers: if cli.ice_servers.is_empty() {
                file.network.ice_servers.clone().unwrap_or_default()
            } else {
                cli.ice_servers.clone()
            },
            heartbeat_interval: non_zero(file.network.heartbeat_interval_ms)
                .map_or(defaults.heartbeat_interval, Duration::from_millis),
            max_peers: non_zero(cli.max_peers)
                .or_else(|| non_zero(file.network.max_peers))
                .unwrap_or(defaults.max_peers),
            stats_interval: non_zero(file.network.stats_interval_ms)
                .map_or(defaults.stats_interval, Duration::from_millis),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| file.log.level.clone())
                .unwrap_or(defaults.log_level),
            log_file: cli
                .log_file
                .clone()
                .or_else(|| file.log.file.clone())
                .unwrap_or(defaults.log_file),
        }
    }

    /// ICE servers for a room bootstrapped at `bootstrap_url`.
    ///
    /// Explicitly configured servers win. Otherwise the bootstrap host is
    /// assumed to run STUN on port 3478, followed by a public fallback.
    #[must_use]
    pub fn ice_servers_for(&self, bootstrap_url: Option<&str>) -> Vec<String> {
        if !self.ice_servers.is_empty() {
            return self.ice_servers.clone();
        }
        derive_ice_servers(bootstrap_url.unwrap_or_default())
    }

    /// Session settings for a room reached through `relay_url`.
    #[must_use]
    pub fn session_config(&self, relay_url: &str) -> SessionConfig {
        let mut config = SessionConfig::new(relay_url, self.display_name.clone());
        config.discovery = DiscoveryConfig {
            heartbeat_interval: self.heartbeat_interval,
            max_peers: self.max_peers,
            ..DiscoveryConfig::default()
        };
        config.max_connections = self.max_peers;
        config.stats_interval = self.stats_interval;
        config
    }
}

/// STUN servers derived from a bootstrap URL.
#[must_use]
pub fn derive_ice_servers(bootstrap_url: &str) -> Vec<String> {
    let trimmed = bootstrap_url.trim();
    if trimmed.is_empty() {
        return vec![FALLBACK_STUN_SERVER.to_string()];
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    match url::Url::parse(&candidate)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
    {
        Some(host) => vec![
            format!("stun:{host}:{BOOTSTRAP_STUN_PORT}"),
            FALLBACK_STUN_SERVER.to_string(),
        ],
        None => vec![FALLBACK_STUN_SERVER.to_string()],
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Treats zero as absent.
fn non_zero<T: Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("huddle").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
