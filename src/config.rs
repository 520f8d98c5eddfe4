//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SEEDSYNC_REMOTE_ADDRESS`,
//!    `SEEDSYNC_REMOTE_PASSWORD`, `SEEDSYNC_LOCAL_PATH`, `SEEDSYNC_DATA_DIR`
//! 2. **Config file**: path via `--config <path>`, or `seedsync.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [general]
//! data_dir = "~/.seedsync"
//! terminate_timeout_ms = 1000
//!
//! [remote]
//! address = "seedbox.example.com"
//! port = 22
//! username = "me"
//! # password = "secret"          # or SEEDSYNC_REMOTE_PASSWORD
//! ssh_key = "~/.ssh/id_ed25519"
//! path = "/home/me/downloads"
//! scan_command = "seedsync scan"
//!
//! [local]
//! path = "/srv/media/incoming"
//!
//! [lftp]
//! num_max_parallel_downloads = 2
//! num_max_parallel_files_per_download = 4
//! num_max_connections_per_file = 4
//!
//! [controller]
//! interval_ms_remote_scan = 30000
//! interval_ms_local_scan = 10000
//! interval_ms_downloading_scan = 1000
//! use_local_path_as_extract_path = true
//!
//! [autoqueue]
//! enabled = true
//! patterns_only = false
//! auto_extract = true
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::util::expand_tilde;

/// Errors from [`Config::load`] and [`Config::validate`].
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: String, error: String },
    /// The config file is not valid TOML for [`Config`].
    Parse { path: String, error: String },
    /// A required setting is missing or out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, error } => {
                write!(f, "Failed to read config file {path}: {error}")
            }
            ConfigError::Parse { path, error } => {
                write!(f, "Failed to parse config file {path}: {error}")
            }
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub lftp: LftpConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub autoqueue: AutoQueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Directory for persisted state (default `~/.seedsync`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Grace period for worker shutdown before SIGKILL (default 1000 ms).
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
}

/// The seedbox.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub address: String,
    /// SSH port (default 22).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// Password login. Override with `SEEDSYNC_REMOTE_PASSWORD`.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key for key-based login.
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Directory on the seedbox to mirror from.
    #[serde(default)]
    pub path: String,
    /// Command run over ssh to scan `path` (default `seedsync scan`).
    #[serde(default = "default_scan_command")]
    pub scan_command: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Directory downloads land in.
    #[serde(default)]
    pub path: String,
}

/// Transfer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct LftpConfig {
    /// lftp binary (default `lftp`).
    #[serde(default = "default_lftp_binary")]
    pub binary: String,
    /// Jobs running at once (default 2).
    #[serde(default = "default_parallel_downloads")]
    pub num_max_parallel_downloads: u32,
    /// Files transferred at once within one mirror job (default 4).
    #[serde(default = "default_parallel_files")]
    pub num_max_parallel_files_per_download: u32,
    /// Segments per file (default 4).
    #[serde(default = "default_connections_per_file")]
    pub num_max_connections_per_file: u32,
    /// Timeout for a single lftp command (default 5000 ms).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Controller timing and extraction target.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_remote_scan_ms")]
    pub interval_ms_remote_scan: u64,
    #[serde(default = "default_local_scan_ms")]
    pub interval_ms_local_scan: u64,
    /// How often lftp job status is polled (default 1000 ms).
    #[serde(default = "default_downloading_scan_ms")]
    pub interval_ms_downloading_scan: u64,
    /// Controller wake-up interval (default 500 ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Where archives are extracted when not extracting in place.
    #[serde(default)]
    pub extract_path: Option<String>,
    /// Extract next to the downloads (default true).
    #[serde(default = "default_true")]
    pub use_local_path_as_extract_path: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoQueueConfig {
    /// Queue new remote files automatically (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only queue names matching a stored pattern (default false).
    #[serde(default)]
    pub patterns_only: bool,
    /// Extract archives once downloaded (default true).
    #[serde(default = "default_true")]
    pub auto_extract: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "~/.seedsync".to_string()
}
fn default_terminate_timeout_ms() -> u64 {
    1000
}
fn default_port() -> u16 {
    22
}
fn default_scan_command() -> String {
    "seedsync scan".to_string()
}
fn default_lftp_binary() -> String {
    "lftp".to_string()
}
fn default_parallel_downloads() -> u32 {
    2
}
fn default_parallel_files() -> u32 {
    4
}
fn default_connections_per_file() -> u32 {
    4
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_remote_scan_ms() -> u64 {
    30000
}
fn default_local_scan_ms() -> u64 {
    10000
}
fn default_downloading_scan_ms() -> u64 {
    1000
}
fn default_tick_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            username: String::new(),
            password: None,
            ssh_key: None,
            path: String::new(),
            scan_command: default_scan_command(),
        }
    }
}

impl Default for LftpConfig {
    fn default() -> Self {
        Self {
            binary: default_lftp_binary(),
            num_max_parallel_downloads: default_parallel_downloads(),
            num_max_parallel_files_per_download: default_parallel_files(),
            num_max_connections_per_file: default_connections_per_file(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_ms_remote_scan: default_remote_scan_ms(),
            interval_ms_local_scan: default_local_scan_ms(),
            interval_ms_downloading_scan: default_downloading_scan_ms(),
            tick_ms: default_tick_ms(),
            extract_path: None,
            use_local_path_as_extract_path: true,
        }
    }
}

impl Default for AutoQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns_only: false,
            auto_extract: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `seedsync.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("seedsync.toml").exists() {
            Self::from_file("seedsync.toml")?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.expand_paths();
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            error: e.to_string(),
        })
    }

    /// Env var overrides, looked up through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("SEEDSYNC_REMOTE_ADDRESS") {
            self.remote.address = address;
        }
        if let Some(password) = lookup("SEEDSYNC_REMOTE_PASSWORD") {
            self.remote.password = Some(password);
        }
        if let Some(path) = lookup("SEEDSYNC_LOCAL_PATH") {
            self.local.path = path;
        }
        if let Some(dir) = lookup("SEEDSYNC_DATA_DIR") {
            self.general.data_dir = dir;
        }
    }

    fn expand_paths(&mut self) {
        self.general.data_dir = expand_tilde(&self.general.data_dir).into_owned();
        self.local.path = expand_tilde(&self.local.path).into_owned();
        if let Some(key) = &self.remote.ssh_key {
            self.remote.ssh_key = Some(expand_tilde(key).into_owned());
        }
        if let Some(dir) = &self.controller.extract_path {
            self.controller.extract_path = Some(expand_tilde(dir).into_owned());
        }
    }

    /// Check the settings the daemon cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("remote.address", &self.remote.address),
            ("remote.username", &self.remote.username),
            ("remote.path", &self.remote.path),
            ("local.path", &self.local.path),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{key} must be set")));
            }
        }
        if !self.controller.use_local_path_as_extract_path
            && self.controller.extract_path.is_none()
        {
            return Err(ConfigError::Invalid(
                "controller.extract_path must be set when not extracting into local.path"
                    .to_string(),
            ));
        }
        if self.controller.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "controller.tick_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory archives are extracted into.
    pub fn extract_dir(&self) -> &str {
        match &self.controller.extract_path {
            Some(dir) if !self.controller.use_local_path_as_extract_path => dir,
            _ => &self.local.path,
        }
    }
}
