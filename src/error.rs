//! Error types for the patch engine
//!
//! Every fallible engine operation returns [`PatchResult`]. The CLI maps
//! [`PatchError::kind`] to remediation text instead of matching on messages.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Coarse classification of a [`PatchError`], stable for callers to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedPlatform,
    InstallNotFound,
    PermissionDenied,
    ProcessRunning,
    AssetNotFound,
    RateLimited,
    NotFound,
    Download,
    Filesystem,
    BackupNotFound,
    Busy,
    Archive,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Installation not found: {}", path.display())]
    InstallNotFound { path: PathBuf },

    #[error("Insufficient permissions for {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Application is running (pid {pids:?})")]
    ProcessRunning { pids: Vec<u32> },

    #[error("Release {release} has no asset for variant '{variant}'")]
    AssetNotFound { variant: String, release: String },

    #[error("GitHub API rate limit exceeded{}", reset.map(|r| format!(" (resets at {})", r)).unwrap_or_default())]
    RateLimited { reset: Option<DateTime<Utc>> },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No backup found at {}", path.display())]
    BackupNotFound { path: PathBuf },

    #[error("Another patch run holds {}", lock.display())]
    Busy { lock: PathBuf },

    #[error("Invalid asar archive {}: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },
}

/// Convenience alias used throughout the crate.
pub type PatchResult<T> = Result<T, PatchError>;

impl PatchError {
    /// Wrap an I/O error with the path it happened at.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PatchError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            PatchError::InstallNotFound { .. } => ErrorKind::InstallNotFound,
            PatchError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            PatchError::ProcessRunning { .. } => ErrorKind::ProcessRunning,
            PatchError::AssetNotFound { .. } => ErrorKind::AssetNotFound,
            PatchError::RateLimited { .. } => ErrorKind::RateLimited,
            PatchError::NotFound { .. } => ErrorKind::NotFound,
            PatchError::Download { .. } => ErrorKind::Download,
            PatchError::Filesystem { .. } => ErrorKind::Filesystem,
            PatchError::BackupNotFound { .. } => ErrorKind::BackupNotFound,
            PatchError::Busy { .. } => ErrorKind::Busy,
            PatchError::Archive { .. } => ErrorKind::Archive,
        }
    }
}

impl ErrorKind {
    /// User-facing remediation, if there is one.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorKind::InstallNotFound => {
                Some("Specify the install location with --path or `asarmod config set custom_path <dir>`")
            }
            ErrorKind::PermissionDenied => {
                Some("Re-run with elevated permissions or point --path at a writable install")
            }
            ErrorKind::ProcessRunning => Some("Close the app first, or pass --force to stop it"),
            ErrorKind::RateLimited => {
                Some("Set a GitHub token with `asarmod config set github_token <token>` or GITHUB_TOKEN")
            }
            ErrorKind::AssetNotFound => Some("The latest release does not ship this variant; try another"),
            ErrorKind::Busy => Some("Wait for the other asarmod run to finish, or delete the lock file if none is running"),
            ErrorKind::BackupNotFound => Some("Nothing to restore; reinstall the app to recover"),
            ErrorKind::Download => Some("Check your connection and retry, or pass --no-cache"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_hint() {
        let err = PatchError::ProcessRunning { pids: vec![1234] };
        assert_eq!(err.kind(), ErrorKind::ProcessRunning);
        assert!(err.kind().hint().unwrap().contains("--force"));
        assert!(err.to_string().contains("1234"));
    }

    #[test]
    fn test_rate_limit_message() {
        let err = PatchError::RateLimited { reset: None };
        assert_eq!(err.to_string(), "GitHub API rate limit exceeded");
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_unsupported_has_no_hint() {
        assert!(ErrorKind::UnsupportedPlatform.hint().is_none());
    }
}
