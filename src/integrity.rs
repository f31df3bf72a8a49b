//! Archive fingerprinting and the integrity bypass.
//!
//! Electron validates `app.asar` at launch by comparing the SHA-256 of the
//! archive header against a hex string compiled into the executable. After
//! swapping the archive we either rewrite that string (Windows) or re-sign
//! the bundle so Gatekeeper accepts the change (macOS).

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::asar;
use crate::error::{PatchError, PatchResult};
use crate::fsutil;

/// SHA-256 of an archive header, as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_header(header_json: &str) -> Self {
        Self(hex::encode(Sha256::digest(header_json.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the integrity step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// Old fingerprint rewritten this many times.
    Patched { replaced: usize },
    /// Fingerprint did not change, nothing to rewrite.
    Unchanged,
    /// Old fingerprint not present in the executable.
    MarkerNotFound,
    ExecutableMissing,
    Resigned,
    ResignFailed(String),
    /// Platform has no integrity check.
    NotApplicable,
}

impl IntegrityOutcome {
    /// Whether the executable on disk was modified.
    pub fn modified_executable(&self) -> bool {
        matches!(self, IntegrityOutcome::Patched { .. })
    }
}

/// Fingerprint an archive by hashing only its header.
pub fn fingerprint(archive: &Path) -> PatchResult<Fingerprint> {
    let header = asar::read_header(archive)?;
    let fp = Fingerprint::of_header(&header.json);
    debug!("Fingerprint of {}: {}", archive.display(), fp);
    Ok(fp)
}

/// `<path>.backup` next to the original.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Replace every non-overlapping occurrence of `old` with `new` in place.
///
/// Both needles must have the same length so no offsets shift.
pub fn replace_all(buf: &mut [u8], old: &[u8], new: &[u8]) -> usize {
    debug_assert_eq!(old.len(), new.len());
    if old.is_empty() || old.len() > buf.len() {
        return 0;
    }

    let mut count = 0;
    let mut i = 0;
    while i + old.len() <= buf.len() {
        if &buf[i..i + old.len()] == old {
            buf[i..i + old.len()].copy_from_slice(new);
            count += 1;
            i += old.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Rewrite the embedded fingerprint inside the executable.
pub fn patch_executable(
    executable: Option<&Path>,
    old: &Fingerprint,
    new: &Fingerprint,
) -> PatchResult<IntegrityOutcome> {
    let Some(exe) = executable else {
        return Ok(IntegrityOutcome::NotApplicable);
    };

    if !exe.exists() {
        warn!("Executable not found, skipping integrity patch: {}", exe.display());
        return Ok(IntegrityOutcome::ExecutableMissing);
    }

    if old == new {
        info!("Archive fingerprint unchanged, executable left as is");
        return Ok(IntegrityOutcome::Unchanged);
    }

    let backup = backup_path(exe);
    if backup.exists() {
        debug!("Executable backup already present: {}", backup.display());
    } else {
        std::fs::copy(exe, &backup).map_err(|e| PatchError::fs(&backup, e))?;
        info!("Backed up executable to {}", backup.display());
    }

    let mut data = std::fs::read(exe).map_err(|e| PatchError::fs(exe, e))?;
    let replaced = replace_all(&mut data, old.as_str().as_bytes(), new.as_str().as_bytes());

    if replaced == 0 {
        warn!(
            "Fingerprint {} not found in {} (already patched?)",
            old,
            exe.display()
        );
        return Ok(IntegrityOutcome::MarkerNotFound);
    }

    fsutil::write_file(exe, &data)?;
    info!("Replaced {} fingerprint occurrence(s) in {}", replaced, exe.display());

    Ok(IntegrityOutcome::Patched { replaced })
}

/// Ad-hoc re-sign a macOS app bundle. Failures only warn.
pub fn resign_bundle(app: &Path) -> IntegrityOutcome {
    let output = Command::new("codesign")
        .args(["--force", "--deep", "--sign", "-"])
        .arg(app)
        .output();

    match output {
        Ok(out) if out.status.success() => {
            info!("Re-signed {}", app.display());
            IntegrityOutcome::Resigned
        }
        Ok(out) => {
            let reason = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!("codesign failed for {}: {}", app.display(), reason);
            IntegrityOutcome::ResignFailed(reason)
        }
        Err(e) => {
            warn!("Could not run codesign: {}", e);
            IntegrityOutcome::ResignFailed(e.to_string())
        }
    }
}
