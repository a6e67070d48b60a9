//! Configuration system for the Palisade client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/palisade/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

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

    /// A configured URL is not parseable.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
        /// Underlying parse error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    identity: IdentityFileConfig,
    crypto: CryptoFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    broker_url: Option<String>,
    rest_base_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<String>,
    peer_id: Option<String>,
    email: Option<String>,
}

/// `[crypto]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CryptoFileConfig {
    otp_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Broker WebSocket URL.
    pub broker_url: Option<String>,
    /// Base URL for the REST collaborators (history, decrypt, status).
    pub rest_base_url: Option<String>,
    /// Timeout for opening the broker connection.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,

    // -- Identity --
    /// Local user identifier.
    pub user_id: Option<String>,
    /// Conversation peer identifier.
    pub peer_id: Option<String>,
    /// Identity watched on the status broadcast.
    pub email: Option<String>,

    // -- Crypto --
    /// Shared OTP secret; absent disables local crypto.
    pub otp_secret: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            rest_base_url: None,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            user_id: None,
            peer_id: None,
            email: None,
            otp_secret: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/palisade/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a configured URL is malformed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate_urls()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            broker_url: cli
                .broker_url
                .clone()
                .or_else(|| file.network.broker_url.clone()),
            rest_base_url: cli
                .rest_url
                .clone()
                .or_else(|| file.network.rest_base_url.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: file
                .network
                .reconnect_delay_secs
                .map_or(defaults.reconnect_delay, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.identity.user_id.clone()),
            peer_id: cli
                .peer_id
                .clone()
                .or_else(|| file.identity.peer_id.clone()),
            email: cli.email.clone().or_else(|| file.identity.email.clone()),
            otp_secret: cli
                .otp_secret
                .clone()
                .or_else(|| file.crypto.otp_secret.clone()),
        }
    }

    /// Check that any configured URLs parse.
    fn validate_urls(&self) -> Result<(), ConfigError> {
        for candidate in [&self.broker_url, &self.rest_base_url]
            .into_iter()
            .flatten()
        {
            url::Url::parse(candidate).map_err(|source| ConfigError::InvalidUrl {
                url: candidate.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Build a [`SessionConfig`] from this configuration, if all required
    /// fields are present.
    ///
    /// Returns `None` if `broker_url`, `user_id`, `peer_id`, or `email` is
    /// missing.
    #[must_use]
    pub fn to_session_config(&self) -> Option<SessionConfig> {
        let broker_url = self.broker_url.clone()?;
        let self_id = self.user_id.clone()?;
        let peer_id = self.peer_id.clone()?;
        let email = self.email.clone()?;
        if peer_id.is_empty() {
            return None;
        }

        Some(SessionConfig {
            broker_url,
            self_id,
            peer_id,
            email,
            otp_secret: self.otp_secret.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            channel_capacity: self.channel_capacity,
        })
    }
}

/// CLI arguments parsed by clap.
///
/// Environment variables are supported via `env` attributes so deployments
/// can configure the client without a config file.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Palisade encrypted chat client")]
pub struct CliArgs {
    /// WebSocket URL of the message broker.
    #[arg(long, env = "PALISADE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Base URL of the REST backend.
    #[arg(long, env = "PALISADE_REST_URL")]
    pub rest_url: Option<String>,

    /// Your local user identifier.
    #[arg(long, env = "PALISADE_USER_ID")]
    pub user_id: Option<String>,

    /// Conversation peer identifier.
    #[arg(long, env = "PALISADE_PEER_ID")]
    pub peer_id: Option<String>,

    /// Account email watched on the status broadcast.
    #[arg(long, env = "PALISADE_EMAIL")]
    pub email: Option<String>,

    /// Shared OTP secret for message encryption.
    #[arg(long, env = "PALISADE_OTP_SECRET")]
    pub otp_secret: Option<String>,

    /// Path to config file (default: `~/.config/palisade/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PALISADE_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
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
        config_dir.join("palisade").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
