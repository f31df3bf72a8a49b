//! Windows: per-user install under %LOCALAPPDATA%\Programs, fingerprint
//! embedded in the executable.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{Platform, PlatformBackend, PlatformProfile, PRODUCT_NAME};
use crate::error::{PatchError, PatchResult};
use crate::integrity::{self, Fingerprint, IntegrityOutcome};
use crate::process::{run_tool, ProcessListing};

pub struct WindowsBackend;

fn image_name() -> String {
    format!("{}.exe", PRODUCT_NAME)
}

/// Parse `tasklist /FO CSV /NH` output, keeping rows for `image`.
///
/// Rows look like `"Sidekick.exe","1234","Console","1","120,332 K"`.
/// Rows that do not parse are skipped.
pub fn parse_tasklist_csv(output: &str, image: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let inner = line.strip_prefix('"')?.strip_suffix('"')?;
            let mut fields = inner.split("\",\"");
            let name = fields.next()?;
            if !name.eq_ignore_ascii_case(image) {
                return None;
            }
            fields.next()?.trim().parse().ok()
        })
        .collect()
}

impl PlatformBackend for WindowsBackend {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn default_root(&self) -> PatchResult<PathBuf> {
        dirs::data_local_dir()
            .map(|dir| dir.join("Programs").join(PRODUCT_NAME))
            .ok_or_else(|| PatchError::NotFound {
                what: "local application data directory".to_string(),
            })
    }

    fn tracks_fingerprint(&self) -> bool {
        true
    }

    fn list_processes(&self, _profile: &PlatformProfile) -> ProcessListing {
        let image = image_name();
        let output = match run_tool(
            Command::new("tasklist")
                .arg("/FI")
                .arg(format!("IMAGENAME eq {}", image))
                .args(["/FO", "CSV", "/NH"]),
        ) {
            Ok(output) => output,
            Err(listing) => return listing,
        };

        if !output.status.success() {
            return ProcessListing::Failed(format!("tasklist exited with {}", output.status));
        }

        ProcessListing::Found(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout), &image))
    }

    fn launch(&self, profile: &PlatformProfile) -> std::io::Result<()> {
        let exe = profile
            .executable_path
            .clone()
            .unwrap_or_else(|| profile.install_root.join(image_name()));
        spawn_detached(&exe, &profile.install_root)
    }

    fn apply_integrity_bypass(
        &self,
        profile: &PlatformProfile,
        before: Option<&Fingerprint>,
        after: Option<&Fingerprint>,
    ) -> PatchResult<IntegrityOutcome> {
        match (before, after) {
            (Some(before), Some(after)) => {
                integrity::patch_executable(profile.executable_path.as_deref(), before, after)
            }
            _ => Ok(IntegrityOutcome::NotApplicable),
        }
    }
}

fn spawn_detached(exe: &Path, cwd: &Path) -> std::io::Result<()> {
    let mut cmd = Command::new(exe);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    cmd.spawn().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tasklist_rows() {
        let out = "\"Sidekick.exe\",\"1234\",\"Console\",\"1\",\"120,332 K\"\r\n\
                   \"Sidekick.exe\",\"5678\",\"Console\",\"1\",\"80,100 K\"\r\n\
                   \"explorer.exe\",\"42\",\"Console\",\"1\",\"10 K\"\r\n";
        assert_eq!(parse_tasklist_csv(out, "Sidekick.exe"), vec![1234, 5678]);
    }

    #[test]
    fn test_parse_tasklist_tolerates_noise() {
        let out = "INFO: No tasks are running which match the specified criteria.\r\n";
        assert!(parse_tasklist_csv(out, "Sidekick.exe").is_empty());

        let broken = "\"Sidekick.exe\",\"notapid\",\"Console\"\n\"sidekick.EXE\",\"77\",\"x\"";
        assert_eq!(parse_tasklist_csv(broken, "Sidekick.exe"), vec![77]);
    }

    #[test]
    fn test_bypass_without_before_is_noop() {
        let profile = PlatformProfile::derive(Platform::Windows, PathBuf::from("C:/nowhere"));
        let fp = Fingerprint::of_header("{}");
        assert_eq!(
            WindowsBackend.apply_integrity_bypass(&profile, None, Some(&fp)).unwrap(),
            IntegrityOutcome::NotApplicable
        );
    }
}
