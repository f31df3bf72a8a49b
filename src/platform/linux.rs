//! Linux: flat install under /opt. There is no integrity check to bypass.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::{Platform, PlatformBackend, PlatformProfile, PRODUCT_NAME};
use crate::error::PatchResult;
use crate::integrity::{Fingerprint, IntegrityOutcome};
use crate::process::{self, ProcessListing};

pub struct LinuxBackend;

fn binary_path(profile: &PlatformProfile) -> PathBuf {
    profile.install_root.join(PRODUCT_NAME.to_lowercase())
}

impl PlatformBackend for LinuxBackend {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn default_root(&self) -> PatchResult<PathBuf> {
        Ok(PathBuf::from("/opt").join(PRODUCT_NAME))
    }

    fn list_processes(&self, profile: &PlatformProfile) -> ProcessListing {
        process::find_by_executable(&binary_path(profile))
    }

    fn launch(&self, profile: &PlatformProfile) -> std::io::Result<()> {
        let mut cmd = Command::new(binary_path(profile));
        cmd.current_dir(&profile.install_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map(|_| ())
    }

    fn apply_integrity_bypass(
        &self,
        _profile: &PlatformProfile,
        _before: Option<&Fingerprint>,
        _after: Option<&Fingerprint>,
    ) -> PatchResult<IntegrityOutcome> {
        Ok(IntegrityOutcome::NotApplicable)
    }
}
