//! Configuration management for Slotline
//!
//! The config file is TOML. Only `[database]` is required; every other
//! section falls back to the defaults below when absent.
//!
//! ```toml
//! [database]
//! path = "~/.local/share/slotline/slotline.db"
//!
//! [x]
//! client_id = "abc123"
//! client_secret_env = "X_CLIENT_SECRET"
//!
//! [storage]
//! url = "https://project.supabase.co"
//! bucket = "media"
//! service_key_env = "SLOTLINE_STORAGE_KEY"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub x: XConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XConfig {
    pub client_id: Option<String>,
    /// Name of the environment variable holding the OAuth client secret
    pub client_secret_env: String,
    pub api_base: String,
    pub handle: Option<String>,
}

impl Default for XConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret_env: "X_CLIENT_SECRET".to_string(),
            api_base: "https://api.x.com".to_string(),
            handle: None,
        }
    }
}

impl XConfig {
    pub fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("x.client_id".to_string()).into())
    }

    pub fn client_secret(&self) -> Result<String> {
        read_secret_env(&self.client_secret_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub url: Option<String>,
    pub bucket: String,
    pub service_key_env: String,
    pub signed_url_ttl_secs: u64,
    /// Longest wait for the next bytes of a sign or download response
    pub read_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            bucket: "media".to_string(),
            service_key_env: "SLOTLINE_STORAGE_KEY".to_string(),
            signed_url_ttl_secs: 60,
            read_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    pub fn url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("storage.url".to_string()).into())
    }

    pub fn service_key(&self) -> Result<String> {
        read_secret_env(&self.service_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// Jobs `running` for longer than this are failed as abandoned.
    /// Unset disables the reaper.
    pub stale_after_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 5,
            stale_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub chunk_size_bytes: usize,
    pub status_poll_interval_ms: u64,
    pub status_max_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            status_poll_interval_ms: 1500,
            status_max_attempts: 20,
        }
    }
}

impl UploadConfig {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    pub refresh_skew_secs: i64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// `SLOTLINE_DB_PATH` overrides `[database] path` when set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("SLOTLINE_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/slotline/slotline.db".to_string(),
            },
            x: XConfig::default(),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            upload: UploadConfig::default(),
            tokens: TokensConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduler.batch_size == 0 {
            return Err(
                ConfigError::MissingField("scheduler.batch_size must be > 0".to_string()).into(),
            );
        }
        if self.upload.chunk_size_bytes == 0 {
            return Err(
                ConfigError::MissingField("upload.chunk_size_bytes must be > 0".to_string()).into(),
            );
        }
        if self.upload.status_max_attempts == 0 {
            return Err(ConfigError::MissingField(
                "upload.status_max_attempts must be > 0".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

fn read_secret_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingField(format!("environment variable {}", var)).into()),
    }
}

/// Resolve the configuration file path (`SLOTLINE_CONFIG`, then the XDG config dir)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SLOTLINE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("slotline").join("config.toml"))
}
