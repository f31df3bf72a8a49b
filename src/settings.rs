//! Persisted user settings
//!
//! Stores the GitHub token and install path override in
//! ~/.config/asarmod/settings.json

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Keys addressable through `asarmod config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    GithubToken,
    CustomPath,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::GithubToken => "github_token",
            SettingKey::CustomPath => "custom_path",
        }
    }
}

impl FromStr for SettingKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "github_token" | "token" => Ok(SettingKey::GithubToken),
            "custom_path" | "path" => Ok(SettingKey::CustomPath),
            other => bail!("Unknown setting '{}' (expected github_token or custom_path)", other),
        }
    }
}

/// User settings for asarmod
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// GitHub token for release API requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Install root override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_path: Option<PathBuf>,
}

impl Settings {
    /// Get the config directory path (~/.config/asarmod)
    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("asarmod");

        Ok(config_dir)
    }

    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        match Self::settings_path().and_then(|p| Self::load_from(&p)) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;

        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    pub fn get(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::GithubToken => self.github_token.clone(),
            SettingKey::CustomPath => self.custom_path.as_ref().map(|p| p.display().to_string()),
        }
    }

    /// Set a value; an empty value clears the key.
    pub fn set(&mut self, key: SettingKey, value: &str) {
        let value = value.trim();
        match key {
            SettingKey::GithubToken => {
                self.github_token = (!value.is_empty()).then(|| value.to_string());
            }
            SettingKey::CustomPath => {
                self.custom_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert!(settings.github_token.is_none());
        assert!(settings.custom_path.is_none());
    }

    #[test]
    fn test_get_set() {
        let mut settings = Settings::default();
        settings.set(SettingKey::GithubToken, "ghp_abc");
        settings.set(SettingKey::CustomPath, "/opt/Custom");
        assert_eq!(settings.get(SettingKey::GithubToken).as_deref(), Some("ghp_abc"));
        assert_eq!(settings.custom_path, Some(PathBuf::from("/opt/Custom")));

        settings.set(SettingKey::GithubToken, "  ");
        assert!(settings.get(SettingKey::GithubToken).is_none());
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.set(SettingKey::GithubToken, "tok");
        settings.save_to(&path)?;

        let loaded = Settings::load_from(&path)?;
        assert_eq!(loaded, settings);

        let raw = std::fs::read_to_string(&path)?;
        assert!(!raw.contains("custom_path"));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_default() -> Result<()> {
        let temp = tempdir()?;
        let loaded = Settings::load_from(&temp.path().join("nope.json"))?;
        assert_eq!(loaded, Settings::default());
        Ok(())
    }

    #[test]
    fn test_key_parse() {
        assert_eq!("github_token".parse::<SettingKey>().unwrap(), SettingKey::GithubToken);
        assert_eq!("path".parse::<SettingKey>().unwrap(), SettingKey::CustomPath);
        assert!("gpu_index".parse::<SettingKey>().is_err());
    }
}
