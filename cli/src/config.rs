// Configuration management for the gattlane CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattlane/config.json
// - Linux: ~/.config/gattlane/config.json
// - Windows: %APPDATA%\gattlane\config.json

use anyhow::{Context, Result};
use gattlane_core::{ConnectionConfiguration, ScannerKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Directory for daily rolling log files; console only when unset
    pub log_dir: Option<String>,

    /// Preferred scanner backend
    pub scanner: Option<ScannerKind>,

    /// Wait between requesting a bond and the first connect attempt
    pub bond_settle_delay_millis: u64,

    /// Defaults handed to every connection
    pub connection: ConnectionConfiguration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            scanner: None,
            bond_settle_delay_millis: 1500,
            connection: ConnectionConfiguration::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("gattlane");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn bond_settle_delay(&self) -> Duration {
        Duration::from_millis(self.bond_settle_delay_millis)
    }

    /// Set a config value. Does not persist; call `save` afterwards.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "log_level" => self.log_level = value.to_string(),
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scanner" => {
                self.scanner = match value {
                    "" | "auto" => None,
                    "le" => Some(ScannerKind::Le),
                    "legacy" => Some(ScannerKind::Legacy),
                    "classic" => Some(ScannerKind::Classic),
                    other => anyhow::bail!("Unknown scanner kind: {}", other),
                };
            }
            "bond_settle_delay_millis" => {
                self.bond_settle_delay_millis = value.parse().context("Invalid number")?;
            }
            "connect_timeout_millis" => {
                let millis: u64 = value.parse().context("Invalid number")?;
                self.connection = self
                    .connection
                    .clone()
                    .with_connect_timeout(Duration::from_millis(millis));
            }
            "request_timeout_millis" => {
                let millis: u64 = value.parse().context("Invalid number")?;
                self.connection = self
                    .connection
                    .clone()
                    .with_request_timeout(Duration::from_millis(millis));
            }
            "discover_services_delay_millis" => {
                self.connection.discover_services_delay_millis =
                    value.parse().context("Invalid number")?;
            }
            "auto_reconnect" => {
                self.connection.auto_reconnect = value.parse().context("Invalid boolean value")?;
            }
            "reconnect_immediately_max_times" => {
                self.connection.reconnect_immediately_max_times =
                    value.parse().context("Invalid number")?;
            }
            "try_reconnect_max_times" => {
                let times: i32 = value.parse().context("Invalid number")?;
                self.connection = self.connection.clone().with_try_reconnect_max_times(times);
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let c = &self.connection;
        vec![
            ("log_level".to_string(), self.log_level.clone()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(console)".to_string()),
            ),
            (
                "scanner".to_string(),
                self.scanner
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "auto".to_string()),
            ),
            (
                "bond_settle_delay_millis".to_string(),
                self.bond_settle_delay_millis.to_string(),
            ),
            (
                "connect_timeout_millis".to_string(),
                c.connect_timeout().as_millis().to_string(),
            ),
            (
                "request_timeout_millis".to_string(),
                c.request_timeout().as_millis().to_string(),
            ),
            (
                "discover_services_delay_millis".to_string(),
                c.discover_services_delay_millis.to_string(),
            ),
            ("auto_reconnect".to_string(), c.auto_reconnect.to_string()),
            (
                "reconnect_immediately_max_times".to_string(),
                c.reconnect_immediately_max_times.to_string(),
            ),
            ("try_reconnect_max_times".to_string(), c.try_reconnect_max_times.to_string()),
            ("backoff_steps".to_string(), c.backoff.steps().len().to_string()),
        ]
    }
}
