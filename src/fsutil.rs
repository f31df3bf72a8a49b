//! Staged file writes
//!
//! Everything that overwrites a file inside the install goes through here:
//! the new content is written to a temp file in the destination directory
//! and renamed over the target, so the target is either old or new.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{PatchError, PatchResult};

/// Map access errors to `PermissionDenied`, everything else to `Filesystem`.
pub(crate) fn permission_or_fs(path: &Path, err: io::Error) -> PatchError {
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => PatchError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PatchError::fs(path, err),
    }
}

fn stage_in(dest: &Path) -> PatchResult<NamedTempFile> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    NamedTempFile::new_in(dir).map_err(|e| permission_or_fs(dir, e))
}

/// Give the staged file the destination's permissions, then rename it over.
fn commit(staged: NamedTempFile, dest: &Path) -> PatchResult<()> {
    staged
        .as_file()
        .sync_all()
        .map_err(|e| PatchError::fs(staged.path(), e))?;

    if let Ok(meta) = fs::metadata(dest) {
        staged
            .as_file()
            .set_permissions(meta.permissions())
            .map_err(|e| PatchError::fs(staged.path(), e))?;
    }

    staged
        .persist(dest)
        .map_err(|e| permission_or_fs(dest, e.error))?;
    debug!("Replaced {}", dest.display());
    Ok(())
}

/// Copy `src` over `dest`.
pub(crate) fn replace_file(src: &Path, dest: &Path) -> PatchResult<()> {
    let mut staged = stage_in(dest)?;
    let mut input = fs::File::open(src).map_err(|e| PatchError::fs(src, e))?;
    io::copy(&mut input, staged.as_file_mut()).map_err(|e| PatchError::fs(staged.path(), e))?;
    commit(staged, dest)
}

/// Write `data` over `dest`.
pub(crate) fn write_file(dest: &Path, data: &[u8]) -> PatchResult<()> {
    let mut staged = stage_in(dest)?;
    staged
        .as_file_mut()
        .write_all(data)
        .map_err(|e| PatchError::fs(staged.path(), e))?;
    commit(staged, dest)
}

/// Open for read and write without truncating.
pub(crate) fn check_read_write(path: &Path) -> PatchResult<()> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| permission_or_fs(path, e))
}

/// Create and drop a temp file where staged writes will land.
pub(crate) fn check_dir_writable(dir: &Path) -> PatchResult<()> {
    NamedTempFile::new_in(dir)
        .map(|_| ())
        .map_err(|e| permission_or_fs(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_replace_file_overwrites() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("new.bin");
        let dest = temp.path().join("app.asar");
        fs::write(&src, b"new contents").unwrap();
        fs::write(&dest, b"old").unwrap();

        replace_file(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new contents");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_write_file_overwrites_in_place() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("Sidekick.exe");
        fs::write(&dest, vec![1u8; 4096]).unwrap();

        write_file(&dest, &[2u8; 4096]).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), vec![2u8; 4096]);
    }

    #[cfg(unix)]
    #[test]
    fn test_staged_write_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let dest = temp.path().join("app.asar");
        fs::write(&dest, b"old").unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o644)).unwrap();

        write_file(&dest, b"new").unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_missing_directory_is_fs_error() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("gone").join("app.asar");
        assert!(matches!(
            write_file(&dest, b"x"),
            Err(PatchError::Filesystem { .. })
        ));
        assert!(matches!(
            check_dir_writable(&temp.path().join("gone")),
            Err(PatchError::Filesystem { .. })
        ));
    }

    #[test]
    fn test_access_errors_map_to_permission_denied() {
        let path = Path::new("/opt/Sidekick/resources");
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            permission_or_fs(path, denied),
            PatchError::PermissionDenied { path: p } if p == path
        ));
        let read_only = io::Error::from(io::ErrorKind::ReadOnlyFilesystem);
        assert!(matches!(
            permission_or_fs(path, read_only),
            PatchError::PermissionDenied { .. }
        ));
        let other = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(permission_or_fs(path, other), PatchError::Filesystem { .. }));
    }

    #[test]
    fn test_check_read_write() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("app.asar");
        fs::write(&file, b"keep me").unwrap();

        check_read_write(&file).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"keep me");
        check_dir_writable(temp.path()).unwrap();
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
