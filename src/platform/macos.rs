//! macOS: app bundle under /Applications, ad-hoc re-sign after patching.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::{Platform, PlatformBackend, PlatformProfile, PRODUCT_NAME};
use crate::error::PatchResult;
use crate::integrity::{self, Fingerprint, IntegrityOutcome};
use crate::process::{self, ProcessListing};

pub struct MacOsBackend;

impl PlatformBackend for MacOsBackend {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn default_root(&self) -> PatchResult<PathBuf> {
        Ok(PathBuf::from("/Applications").join(format!("{}.app", PRODUCT_NAME)))
    }

    fn list_processes(&self, profile: &PlatformProfile) -> ProcessListing {
        let main_binary = profile.install_root.join("Contents").join("MacOS").join(PRODUCT_NAME);
        process::find_by_executable(&main_binary)
    }

    fn launch(&self, profile: &PlatformProfile) -> std::io::Result<()> {
        Command::new("open")
            .arg(&profile.install_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
    }

    fn apply_integrity_bypass(
        &self,
        profile: &PlatformProfile,
        _before: Option<&Fingerprint>,
        _after: Option<&Fingerprint>,
    ) -> PatchResult<IntegrityOutcome> {
        Ok(integrity::resign_bundle(&profile.install_root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_root_is_bundle() {
        let root = MacOsBackend.default_root().unwrap();
        assert_eq!(root, PathBuf::from("/Applications/Sidekick.app"));
        let profile = MacOsBackend.resolve(None).unwrap();
        assert!(profile.archive_path.ends_with("Contents/Resources/app.asar"));
        assert!(!MacOsBackend.tracks_fingerprint());
    }
}
