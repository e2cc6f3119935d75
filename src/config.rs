use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cloud: CloudConfig,
    pub peer: PeerConfig,
    pub sync: SyncConfig,
}

/// Local database location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file (empty = default data dir)
    pub db_path: Option<String>,
}

/// Cloud snapshot host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Collection endpoint; records live at `{base_url}/{id}`
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://jsonblob.com/api/jsonBlob".to_string(),
            timeout_secs: 30,
        }
    }
}

impl CloudConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Peer channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Listen address when hosting
    pub bind_addr: String,
    /// Host name advertised in the peer id (e.g. a LAN name)
    pub advertise_host: Option<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            advertise_host: None,
        }
    }
}

/// Cloud reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between auto-sync scans (0 = disabled)
    pub auto_sync_interval_secs: u64,
    /// Style hint passed to media regeneration
    pub media_style: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval_secs: 300,
            media_style: "photo".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_secs > 0).then(|| Duration::from_secs(self.auto_sync_interval_secs))
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("tactdeck");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Database file to open.
    pub fn db_path(&self) -> Result<PathBuf> {
        match self.storage.db_path.as_deref() {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => crate::deck_db::DeckDb::default_path(),
        }
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.storage.db_path.is_none());
        assert_eq!(config.cloud.base_url, "https://jsonblob.com/api/jsonBlob");
        assert_eq!(config.cloud.timeout_secs, 30);
        assert_eq!(config.peer.bind_addr, "0.0.0.0:0");
        assert_eq!(config.sync.auto_sync_interval_secs, 300);
        assert_eq!(config.sync.media_style, "photo");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[cloud]
base_url = "http://localhost:9999/bins"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.cloud.base_url, "http://localhost:9999/bins");
        assert_eq!(config.cloud.timeout_secs, 30);
        assert_eq!(config.sync.media_style, "photo");
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[storage]
db_path = "/tmp/decks.redb"

[cloud]
base_url = "https://example.test/blobs"
timeout_secs = 5

[peer]
bind_addr = "0.0.0.0:7777"
advertise_host = "tablet.local"

[sync]
auto_sync_interval_secs = 0
media_style = "cartoon"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.db_path().unwrap(), PathBuf::from("/tmp/decks.redb"));
        assert_eq!(config.cloud.timeout(), Duration::from_secs(5));
        assert_eq!(config.peer.advertise_host.as_deref(), Some("tablet.local"));
        assert!(config.sync.auto_sync_interval().is_none());
        assert_eq!(config.sync.media_style, "cartoon");
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }
}
