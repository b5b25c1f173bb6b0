//! Connection configuration.
//!
//! [`GcsConfig`] carries every tunable the core honors: packet size,
//! receive queue capacity, flow control watermarks, logging knobs and the
//! TLS material for transports that support it. Loading merges built-in
//! defaults, a `starling.toml` project file, and `STARLING_*` environment
//! variables, in that precedence order.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use starling_wire::MIN_PACKET_SIZE;

/// Default maximum packet size in bytes (a multiple of common MTUs is
/// recommended).
pub const DEFAULT_PACKET_SIZE: usize = 64_500;

/// Default receive queue capacity in actions.
pub const DEFAULT_RECV_QUEUE_CAP: usize = 1024;

/// Default flow control high-water mark (queue depth).
pub const DEFAULT_FC_UPPER: usize = 32;

/// Default flow control low-water mark (queue depth).
pub const DEFAULT_FC_LOWER: usize = 16;

/// Errors from configuration loading or validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Multi-source merge failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value failed structural validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A referenced file could not be read.
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// TLS material for transports that support it.
///
/// The dummy backend ignores these; they are validated and held for the
/// transports that consume them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Path to the CA bundle used to verify peers.
    pub verify_path: Option<PathBuf>,

    /// Path to this node's certificate (PEM).
    pub cert_path: Option<PathBuf>,

    /// Path to this node's private key (PEM).
    pub key_path: Option<PathBuf>,

    /// Path to a file whose first line is the private key password.
    pub password_file: Option<PathBuf>,
}

impl TlsOptions {
    /// Reads the private key password: the first line of `password_file`.
    ///
    /// Returns `None` when no password file is configured.
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = &self.password_file else {
            return Ok(None);
        };
        let file = std::fs::File::open(path).map_err(|source| ConfigError::FileRead {
            path: path.clone(),
            source,
        })?;
        let mut line = String::new();
        BufReader::new(file)
            .read_line(&mut line)
            .map_err(|source| ConfigError::FileRead {
                path: path.clone(),
                source,
            })?;
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Tunables for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Human-readable member name carried in configuration actions.
    pub node_name: String,

    /// Maximum transport packet size in bytes.
    pub packet_size: usize,

    /// Receive queue capacity in actions.
    pub recv_queue_cap: usize,

    /// Flow control high-water mark: crossing it broadcasts a stop.
    pub fc_upper: usize,

    /// Flow control low-water mark: falling back under it broadcasts a
    /// continue.
    pub fc_lower: usize,

    /// Enable debug-level logging.
    pub debug: bool,

    /// Optional log file sink; stderr when unset.
    pub log_file: Option<PathBuf>,

    /// Prefix log lines with a timestamp.
    pub self_tstamp: bool,

    /// TLS material, when the transport supports it.
    pub tls: Option<TlsOptions>,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            node_name: "starling".to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            recv_queue_cap: DEFAULT_RECV_QUEUE_CAP,
            fc_upper: DEFAULT_FC_UPPER,
            fc_lower: DEFAULT_FC_LOWER,
            debug: false,
            log_file: None,
            self_tstamp: true,
            tls: None,
        }
    }
}

impl GcsConfig {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size < MIN_PACKET_SIZE {
            return Err(ConfigError::Invalid(format!(
                "packet_size {} below minimum {MIN_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.recv_queue_cap == 0 {
            return Err(ConfigError::Invalid("recv_queue_cap must be positive".into()));
        }
        if self.fc_lower > self.fc_upper {
            return Err(ConfigError::Invalid(format!(
                "fc_lower {} above fc_upper {}",
                self.fc_lower, self.fc_upper
            )));
        }
        if self.fc_upper > self.recv_queue_cap {
            return Err(ConfigError::Invalid(format!(
                "fc_upper {} above recv_queue_cap {}",
                self.fc_upper, self.recv_queue_cap
            )));
        }
        Ok(())
    }
}

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "STARLING".to_string(),
        }
    }

    /// Sets the project directory to look for `starling.toml` in.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: `STARLING`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<GcsConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        builder = builder.add_source(config::Config::try_from(&GcsConfig::default())?);

        // 2. Project config (starling.toml)
        let project_file = self.project_dir.join("starling.toml");
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment variables (STARLING_*)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: GcsConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Loads configuration or returns defaults if loading fails.
    pub fn load_or_default(self) -> GcsConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
