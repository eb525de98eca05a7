//! Configuration management for the download manager
//!
//! Settings come from a TOML file with every field optional. The file is
//! looked up in the working directory first, then in the user's config
//! directory, where a commented default is written on first run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{ClientConfig, ManagerConfig};
use crate::constants::{files, http, logging};
use crate::errors::{AppError, ConfigError, Result};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP client settings
    pub client: ClientConfigToml,
    /// Where and how new downloads run
    pub downloads: DownloadsConfigToml,
    /// Restart persistence
    pub store: StoreConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// TOML-friendly client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfigToml {
    /// Connection establishment timeout, e.g. "30s"
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// TCP keep-alive interval (None = disabled)
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
    /// TCP nodelay setting
    pub tcp_nodelay: bool,
    /// Connection pool idle timeout (None = no timeout)
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Option<Duration>,
    pub user_agent: String,
    /// Redirect hops followed before a transfer fails
    pub max_redirects: usize,
    /// PEM files of self-signed certificates to trust
    pub accepted_certificates: Vec<PathBuf>,
}

impl Default for ClientConfigToml {
    fn default() -> Self {
        Self {
            connect_timeout: http::CONNECT_TIMEOUT,
            tcp_keepalive: Some(http::TCP_KEEPALIVE),
            tcp_nodelay: true,
            pool_idle_timeout: Some(http::POOL_IDLE_TIMEOUT),
            user_agent: http::USER_AGENT.to_string(),
            max_redirects: http::MAX_REDIRECTS,
            accepted_certificates: Vec::new(),
        }
    }
}

/// TOML-friendly download defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadsConfigToml {
    /// Directory new files are written to (None = platform download dir)
    pub download_root: Option<PathBuf>,
    /// Bytes per second for new transfers (0 = unlimited)
    pub default_throttle: u64,
    /// Whether new transfers may use metered connections
    pub allow_mobile_data: bool,
}

impl Default for DownloadsConfigToml {
    fn default() -> Self {
        Self {
            download_root: None,
            default_throttle: 0,
            allow_mobile_data: true,
        }
    }
}

/// TOML-friendly store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfigToml {
    /// Directory of persisted transfer records (None = platform data dir)
    pub metadata_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level for the application
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl AppConfig {
    /// Convert TOML-friendly configuration to runtime configuration
    pub fn to_runtime_config(&self) -> (ClientConfig, ManagerConfig) {
        (
            self.client.to_runtime_config(),
            self.downloads.to_runtime_config(self.client.max_redirects),
        )
    }

    /// Directory of the metadata store
    pub fn metadata_dir(&self) -> PathBuf {
        self.store.metadata_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join(files::APP_DIR_NAME).join("transfers"))
                .unwrap_or_else(|| PathBuf::from("./transfers"))
        })
    }

    /// Load configuration with multi-source precedence:
    /// 1. Explicit config file (must exist)
    /// 2. First config file found in the standard locations
    /// 3. Default values
    pub async fn load(config_file_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_file_override {
            Some(path) if path.exists() => Some(path),
            Some(path) => return Err(ConfigError::NotFound { path }.into()),
            None => Self::find_config_file(),
        };

        let config = match config_path {
            Some(path) => Self::load_from_file(&path).await?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the manager misbehave
    pub fn validate(&self) -> Result<()> {
        if self.client.max_redirects == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client.max_redirects".to_string(),
                value: "0".to_string(),
                reason: "At least one redirect hop must be allowed".to_string(),
            }
            .into());
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                value: self.logging.level.clone(),
                reason: format!("Expected one of {}", LOG_LEVELS.join(", ")),
            }
            .into());
        }
        Ok(())
    }

    /// Initialize configuration on first run
    ///
    /// Creates a default config file if none exists and notifies the user
    pub async fn initialize_first_run() -> Result<Option<PathBuf>> {
        let config_path = Self::get_default_config_path()?;

        if config_path.exists() {
            return Ok(Some(config_path));
        }

        info!("Creating default configuration file...");

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::generic(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(&config_path, Self::generate_default_config_content())
            .await
            .map_err(|e| {
                AppError::generic(format!(
                    "Failed to write config file {}: {}",
                    config_path.display(),
                    e
                ))
            })?;

        println!("📁 Created default configuration file:");
        println!("   {}", config_path.display());
        println!("   You can customize settings by editing this file.");
        println!();

        Ok(Some(config_path))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from("./download-manager.toml")];
        if let Ok(user_config) = Self::get_default_config_path() {
            search_paths.push(user_config);
        }

        let found = search_paths.into_iter().find(|path| path.exists());
        match &found {
            Some(path) => debug!("Found config file: {}", path.display()),
            None => debug!("No config file found in standard locations"),
        }
        found
    }

    /// Get the default config file path for the current user
    pub fn get_default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoUserDirectory { kind: "config" })?;
        Ok(config_dir
            .join(files::APP_DIR_NAME)
            .join(files::CONFIG_FILE_NAME))
    }

    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::generic(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(ConfigError::from)?;
        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Generate default configuration content with helpful comments
    fn generate_default_config_content() -> String {
        let download_root = default_download_root();
        format!(
            r#"# Download Manager Configuration
# This file was automatically generated on first run.
# You can customize any of these settings to suit your needs.

[client]
# Durations use humantime syntax ("30s", "2m", "1h 30m")
connect_timeout = "30s"
tcp_keepalive = "30s"
tcp_nodelay = true
pool_idle_timeout = "1m 30s"
user_agent = "{}"
max_redirects = {}
# Self-signed certificates to trust, as PEM files
accepted_certificates = []

[downloads]
# Default destination: {}
# download_root = "/path/to/downloads"

# Bytes per second for new transfers (0 = unlimited)
default_throttle = 0

# Allow new transfers on mobile or unknown networks
allow_mobile_data = true

[store]
# Where transfer records are kept for resuming after a restart
# metadata_dir = "/path/to/records"

[logging]
level = "warn"  # error, warn, info, debug, trace
"#,
            http::USER_AGENT,
            http::MAX_REDIRECTS,
            download_root.display()
        )
    }
}

fn default_download_root() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ClientConfigToml {
    /// Convert to runtime ClientConfig
    pub fn to_runtime_config(&self) -> ClientConfig {
        ClientConfig {
            tcp_keepalive: self.tcp_keepalive,
            tcp_nodelay: self.tcp_nodelay,
            pool_idle_timeout: self.pool_idle_timeout,
            connect_timeout: self.connect_timeout,
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
            accepted_certificates: self.accepted_certificates.clone(),
        }
    }
}

impl DownloadsConfigToml {
    /// Convert to runtime ManagerConfig
    pub fn to_runtime_config(&self, max_redirects: usize) -> ManagerConfig {
        ManagerConfig {
            download_root: self
                .download_root
                .clone()
                .unwrap_or_else(default_download_root),
            default_throttle: self.default_throttle,
            allow_mobile_data: self.allow_mobile_data,
            max_redirects,
        }
    }
}
