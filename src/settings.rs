//! Persisted user settings.
//!
//! A single JSON record in `$HOME/.ikspoz` remembers the relay instance that
//! `ikspoz auto` runs against.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the settings record inside the settings directory.
pub const SETTINGS_FILE_NAME: &str = ".ikspoz";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_relay_auto_instance: Option<AutoInstance>,
}

/// Relay resources provisioned for `ikspoz auto`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoInstance {
    pub subscription_id: String,
    pub resource_group: String,
    pub relay_namespace: String,
    pub connection_name: String,
    pub connection_string: String,
    pub namespace_was_auto_created: bool,
}

impl UserSettings {
    /// A copy of these settings with the auto instance replaced.
    pub fn with_auto_instance(&self, instance: Option<AutoInstance>) -> Self {
        Self {
            azure_relay_auto_instance: instance,
        }
    }
}

pub trait UserSettingsManager {
    fn load(&self) -> Result<UserSettings>;
    fn save(&self, settings: &UserSettings) -> Result<()>;
}

/// Stores settings as indented JSON in a single file.
#[derive(Debug, Clone)]
pub struct FileSystemSettingsManager {
    path: PathBuf,
}

impl FileSystemSettingsManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manager for `.ikspoz` in the user's home directory, or the current
    /// directory when there is no home.
    pub fn in_home_dir() -> Self {
        let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir.join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UserSettingsManager for FileSystemSettingsManager {
    fn load(&self) -> Result<UserSettings> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(UserSettings::default()),
            Err(e) => {
                return Err(Error::settings(format!(
                    "Failed to read '{}': {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(UserSettings::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Error::settings(format!("Invalid settings in '{}': {}", self.path.display(), e))
        })
    }

    fn save(&self, settings: &UserSettings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| Error::settings(format!("Failed to serialize settings: {}", e)))?;
        // fs::write truncates, so a shorter record never leaves stale bytes behind.
        std::fs::write(&self.path, json).map_err(|e| {
            Error::settings(format!("Failed to write '{}': {}", self.path.display(), e))
        })?;
        tracing::debug!(path = %self.path.display(), "Saved user settings");
        Ok(())
    }
}
