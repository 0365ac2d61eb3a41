//! GarlicCraft Settings
//!
//! The minimum external configuration the core consumes, persisted as JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Advertised host for inbound connections.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port shared by NTCP and SSU.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Also bind IPv6.
    #[serde(default)]
    pub v6: bool,

    /// Participate in the DHT as a floodfill.
    #[serde(default)]
    pub floodfill: bool,

    /// Bandwidth class letter (L low, O high, P extra).
    #[serde(default = "default_bandwidth")]
    pub bandwidth: char,

    /// Data directory (netDb, router.keys); defaults to ~/.garliccraft.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Cap on tunnels relayed for other routers.
    #[serde(default = "default_max_participating")]
    pub max_participating: usize,

    /// Restrict own tunnels to these router hashes (base64).
    #[serde(default)]
    pub explicit_peers: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12287
}

fn default_bandwidth() -> char {
    'L'
}

fn default_max_participating() -> usize {
    2500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            v6: false,
            floodfill: false,
            bandwidth: default_bandwidth(),
            data_dir: None,
            max_participating: default_max_participating(),
            explicit_peers: Vec::new(),
        }
    }
}

impl Settings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(garliccraft_keystore::default_data_dir)
    }

    /// Load from `path`, or fall back to defaults when absent.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::WriteError)?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 12287);
        assert!(!settings.floodfill);
        assert_eq!(settings.bandwidth, 'L');
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.floodfill = true;
        settings.port = 4444;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert!(loaded.floodfill);
        assert_eq!(loaded.port, 4444);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let loaded = Settings::load_from(&PathBuf::from("/nonexistent/settings.json")).unwrap();
        assert_eq!(loaded.port, Settings::default().port);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"port": 9999}"#).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.port, 9999);
        assert_eq!(loaded.host, "127.0.0.1");
    }
}
