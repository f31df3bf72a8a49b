//! Patch run configuration
//!
//! Built once per invocation and passed by reference to every step.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::settings::Settings;

/// Which build of the mod to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchVariant {
    #[default]
    Default,
    /// Only unlocks developer tools.
    DevtoolsOnly,
}

impl PatchVariant {
    /// Release asset name, without the optional `.gz` suffix.
    pub fn asset_name(self) -> &'static str {
        match self {
            PatchVariant::Default => "app.asar",
            PatchVariant::DevtoolsOnly => "app-devtools.asar",
        }
    }
}

impl fmt::Display for PatchVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchVariant::Default => "default",
            PatchVariant::DevtoolsOnly => "devtools",
        })
    }
}

impl FromStr for PatchVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PatchVariant::Default),
            "devtools" | "devtools-only" => Ok(PatchVariant::DevtoolsOnly),
            other => Err(format!("unknown variant '{}' (expected default or devtools)", other)),
        }
    }
}

/// Configuration for one patch run
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub variant: PatchVariant,

    /// Install root override; platform default when unset
    pub install_root: Option<PathBuf>,

    /// Reuse a size-valid cached download
    pub use_cache: bool,

    /// Keep downloaded and working files after the run
    pub keep_cache: bool,

    /// GitHub token for release API requests
    pub token: Option<String>,

    /// Stop running instances instead of refusing to patch
    pub force_stop: bool,

    /// Start the app again if it was stopped
    pub relaunch: bool,
}

impl Default for PatchRequest {
    fn default() -> Self {
        Self {
            variant: PatchVariant::Default,
            install_root: None,
            use_cache: true,
            keep_cache: false,
            token: None,
            force_stop: false,
            relaunch: true,
        }
    }
}

impl PatchRequest {
    /// Fill unset token and install root from persisted settings.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if self.token.is_none() {
            self.token = settings.github_token.clone();
        }
        if self.install_root.is_none() {
            self.install_root = settings.custom_path.clone();
        }
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_names() {
        assert_eq!(PatchVariant::Default.asset_name(), "app.asar");
        assert_eq!("devtools".parse::<PatchVariant>().unwrap(), PatchVariant::DevtoolsOnly);
        assert!("nightly".parse::<PatchVariant>().is_err());
    }

    #[test]
    fn test_settings_fill_only_missing() {
        let settings = Settings {
            github_token: Some("from-settings".into()),
            custom_path: Some(PathBuf::from("/opt/Other")),
        };

        let request = PatchRequest::default().with_settings(&settings);
        assert_eq!(request.token(), Some("from-settings"));
        assert_eq!(request.install_root, Some(PathBuf::from("/opt/Other")));

        let request = PatchRequest {
            token: Some("cli".into()),
            install_root: Some(PathBuf::from("/cli")),
            ..Default::default()
        }
        .with_settings(&settings);
        assert_eq!(request.token(), Some("cli"));
        assert_eq!(request.install_root, Some(PathBuf::from("/cli")));
    }

    #[test]
    fn test_empty_token_is_none() {
        let request = PatchRequest {
            token: Some(String::new()),
            ..Default::default()
        };
        assert!(request.token().is_none());
    }
}
