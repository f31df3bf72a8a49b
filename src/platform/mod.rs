//! Per-OS install layout and platform operations
//!
//! The backend is chosen once from the running OS and then used through the
//! [`PlatformBackend`] trait:
//! - path resolution (default install root, archive, executable)
//! - process enumeration, termination and relaunch
//! - the integrity bypass (exe hash rewrite, bundle re-sign, or nothing)

mod linux;
mod macos;
mod windows;

pub use linux::LinuxBackend;
pub use macos::MacOsBackend;
pub use windows::WindowsBackend;

use std::fmt;
use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::error::{PatchError, PatchResult};
use crate::integrity::{Fingerprint, IntegrityOutcome};
use crate::process::ProcessListing;

/// Product name of the patched application.
pub const PRODUCT_NAME: &str = "Sidekick";

/// File name of the resource archive.
pub const ARCHIVE_NAME: &str = "app.asar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    /// Map a `std::env::consts::OS` value.
    pub fn from_os(os: &str) -> PatchResult<Self> {
        match os {
            "windows" => Ok(Platform::Windows),
            "macos" => Ok(Platform::MacOs),
            "linux" => Ok(Platform::Linux),
            other => Err(PatchError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn current() -> PatchResult<Self> {
        Self::from_os(std::env::consts::OS)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        })
    }
}

/// Resolved install layout. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub install_root: PathBuf,
    pub archive_path: PathBuf,
    /// Only Windows embeds the archive fingerprint in a binary we patch.
    pub executable_path: Option<PathBuf>,
}

impl PlatformProfile {
    /// Derive archive and executable paths from an install root.
    pub fn derive(platform: Platform, install_root: PathBuf) -> Self {
        let (archive_path, executable_path) = match platform {
            Platform::Windows => (
                install_root.join("resources").join(ARCHIVE_NAME),
                Some(install_root.join(format!("{}.exe", PRODUCT_NAME))),
            ),
            Platform::MacOs => (
                install_root.join("Contents").join("Resources").join(ARCHIVE_NAME),
                None,
            ),
            Platform::Linux => (install_root.join("resources").join(ARCHIVE_NAME), None),
        };

        Self {
            platform,
            install_root,
            archive_path,
            executable_path,
        }
    }
}

/// Everything that differs between operating systems.
pub trait PlatformBackend: Send + Sync {
    fn platform(&self) -> Platform;

    /// Default install root when the user gave none.
    fn default_root(&self) -> PatchResult<PathBuf>;

    fn resolve(&self, custom_root: Option<&Path>) -> PatchResult<PlatformProfile> {
        let root = match custom_root {
            Some(root) => root.to_path_buf(),
            None => self.default_root()?,
        };
        let profile = PlatformProfile::derive(self.platform(), root);
        debug!("Resolved {} profile: {:?}", self.platform(), profile);
        Ok(profile)
    }

    /// Whether the archive fingerprint must be captured around the replace.
    fn tracks_fingerprint(&self) -> bool {
        false
    }

    fn list_processes(&self, profile: &PlatformProfile) -> ProcessListing;

    /// Best-effort kill of one process. Returns whether a signal was sent.
    fn terminate(&self, pid: u32) -> bool {
        kill_pid(pid)
    }

    /// Start the app detached from this process.
    fn launch(&self, profile: &PlatformProfile) -> std::io::Result<()>;

    fn apply_integrity_bypass(
        &self,
        profile: &PlatformProfile,
        before: Option<&Fingerprint>,
        after: Option<&Fingerprint>,
    ) -> PatchResult<IntegrityOutcome>;
}

/// Backend for the OS this binary runs on.
pub fn current_backend() -> PatchResult<Box<dyn PlatformBackend>> {
    Ok(backend_for(Platform::current()?))
}

pub fn backend_for(platform: Platform) -> Box<dyn PlatformBackend> {
    match platform {
        Platform::Windows => Box::new(WindowsBackend),
        Platform::MacOs => Box::new(MacOsBackend),
        Platform::Linux => Box::new(LinuxBackend),
    }
}

pub(crate) fn kill_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.kill()).unwrap_or(false)
}

/// Whether a pid refers to a live process.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_os() {
        assert_eq!(Platform::from_os("windows").unwrap(), Platform::Windows);
        assert_eq!(Platform::from_os("macos").unwrap(), Platform::MacOs);
        assert_eq!(Platform::from_os("linux").unwrap(), Platform::Linux);
        assert!(matches!(
            Platform::from_os("freebsd"),
            Err(PatchError::UnsupportedPlatform(os)) if os == "freebsd"
        ));
    }

    #[test]
    fn test_derive_windows() {
        let profile = PlatformProfile::derive(Platform::Windows, PathBuf::from("C:/Apps/Sidekick"));
        assert_eq!(
            profile.archive_path,
            PathBuf::from("C:/Apps/Sidekick").join("resources").join("app.asar")
        );
        assert_eq!(
            profile.executable_path,
            Some(PathBuf::from("C:/Apps/Sidekick").join("Sidekick.exe"))
        );
    }

    #[test]
    fn test_derive_macos_bundle() {
        let profile = PlatformProfile::derive(Platform::MacOs, PathBuf::from("/Applications/Sidekick.app"));
        assert_eq!(
            profile.archive_path,
            PathBuf::from("/Applications/Sidekick.app/Contents/Resources/app.asar")
        );
        assert!(profile.executable_path.is_none());
    }

    #[test]
    fn test_custom_root_overrides_default() {
        let backend = backend_for(Platform::Linux);
        let profile = backend.resolve(Some(Path::new("/srv/sidekick"))).unwrap();
        assert_eq!(profile.install_root, PathBuf::from("/srv/sidekick"));
        assert_eq!(profile.archive_path, PathBuf::from("/srv/sidekick/resources/app.asar"));
    }

    #[test]
    fn test_default_roots_differ() {
        let linux = backend_for(Platform::Linux).default_root().unwrap();
        let mac = backend_for(Platform::MacOs).default_root().unwrap();
        assert_ne!(linux, mac);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
