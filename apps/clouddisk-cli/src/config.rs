//! Client configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/clouddisk/client.toml`
//! - Windows: `%APPDATA%/clouddisk/client.toml`
//!
//! The bearer token is never stored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clouddisk_api::ClientSettings;
use clouddisk_transfer::ManagerConfig;
use serde::{Deserialize, Serialize};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API root of the CloudDisk server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Where downloads are written when no directory is given.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,

    /// Number of folder listings kept in memory.
    #[serde(default = "default_cache_capacity")]
    pub listing_cache_capacity: usize,
}

fn default_server_url() -> String {
    ClientSettings::default().base_url
}

fn default_download_dir() -> String {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".into());
    PathBuf::from(home)
        .join("Downloads")
        .to_string_lossy()
        .into_owned()
}

fn default_request_timeout() -> u64 {
    clouddisk_api::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_probe_timeout() -> u64 {
    clouddisk_api::DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_max_concurrent() -> usize {
    clouddisk_transfer::DEFAULT_MAX_CONCURRENT
}

fn default_cache_capacity() -> usize {
    clouddisk_listing_cache::DEFAULT_CAPACITY
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            download_dir: default_download_dir(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            max_concurrent_transfers: default_max_concurrent(),
            listing_cache_capacity: default_cache_capacity(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = ClientConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// HTTP client settings for this configuration and `token`.
    pub fn client_settings(&self, token: Option<String>) -> ClientSettings {
        ClientSettings {
            base_url: self.server_url.clone(),
            token,
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent: self.max_concurrent_transfers,
        }
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("clouddisk")
            .join("client.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("clouddisk").join("client.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/clouddisk/client.toml"))
    }
}
