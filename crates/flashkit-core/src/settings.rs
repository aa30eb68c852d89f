//! Persistent user settings for Flashkit
//!
//! Settings are stored in a TOML configuration file at:
//! - Linux: `~/.config/flashkit/flashkit_config.toml`
//! - macOS: `~/Library/Application Support/flashkit/flashkit_config.toml`
//! - Windows: `%APPDATA%\flashkit\flashkit_config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! [flash]
//! block_size = "4K"
//! verify = true
//! checksum = "crc32"
//! max_run = "128K"
//!
//! [behavior]
//! skip_confirmation = false
//! quiet = false
//! ```

use crate::checksum::ChecksumAlgorithm;
use crate::config::{parse_size, FlashConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "flashkit_config.toml";

/// Application name for config directory
const APP_NAME: &str = "flashkit";

/// User settings loaded from configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Flash defaults
    pub flash: FlashSettings,

    /// Behavior settings
    pub behavior: BehaviorSettings,
}

/// Defaults for flash runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashSettings {
    /// Block size (e.g., "4K", "1M")
    pub block_size: String,

    /// Whether to verify after writing
    pub verify: bool,

    /// Checksum algorithm used for verification
    pub checksum: String,

    /// Cap on a coalesced write (e.g., "128K")
    pub max_run: String,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            block_size: "4K".to_string(),
            verify: false,
            checksum: "crc32".to_string(),
            max_run: "128K".to_string(),
        }
    }
}

impl FlashSettings {
    /// Build a runtime config from these settings
    pub fn to_config(&self) -> Result<FlashConfig, SettingsError> {
        let block_size = parse_size(&self.block_size).map_err(|e| SettingsError::Invalid {
            key: "flash.block_size",
            message: e.to_string(),
        })?;
        let max_run = parse_size(&self.max_run).map_err(|e| SettingsError::Invalid {
            key: "flash.max_run",
            message: e.to_string(),
        })?;
        let algorithm: ChecksumAlgorithm =
            self.checksum.parse().map_err(|e: crate::Error| SettingsError::Invalid {
                key: "flash.checksum",
                message: e.to_string(),
            })?;

        Ok(FlashConfig::new()
            .block_size(block_size)
            .verify(self.verify)
            .checksum_algorithm(algorithm)
            .max_run_bytes(max_run))
    }
}

/// General behavior settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BehaviorSettings {
    /// Whether to skip confirmation prompts by default
    pub skip_confirmation: bool,

    /// Whether to suppress non-error output
    pub quiet: bool,
}

impl Settings {
    /// Load settings from the configuration file
    ///
    /// Returns default settings if the file doesn't exist or can't be parsed
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            tracing::debug!("No config path available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Ok(settings) => {
                tracing::debug!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                tracing::warn!("Ignoring config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Parse settings from TOML text
    pub fn parse(contents: &str) -> Result<Self, SettingsError> {
        toml::from_str(contents).map_err(SettingsError::Deserialize)
    }

    /// Save settings to the configuration file
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        self.save_to_path(Self::config_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;

        std::fs::write(&path, contents).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(path)
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE_NAME))
    }

    /// Get the path to the configuration directory
    pub fn config_dir() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_NAME))
    }

    /// Generate a default configuration file content as a string
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate default config"))
    }
}

/// Errors that can occur when working with settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No configuration directory available
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Failed to read or write config file
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path that caused the error
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// Failed to serialize settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(toml::ser::Error),

    /// Failed to deserialize settings
    #[error("Failed to parse settings: {0}")]
    Deserialize(toml::de::Error),

    /// A value parsed but makes no sense
    #[error("Invalid value for {key}: {message}")]
    Invalid {
        /// Dotted key name
        key: &'static str,
        /// What was wrong
        message: String,
    },
}
