//! Downloaded archive cache
//!
//! Layout under the per-user cache root (`~/.cache/asarmod` on Linux):
//! - `temp/<asset-name>`: downloaded asset, reused when its size matches
//! - `temp/app.asar`: decompressed working copy of a `.gz` asset
//! - `temp/app.asar.backup`: the live archive as it was before patching
//! - `asarmod.lock`: held for the duration of a patch run

use flate2::read::GzDecoder;
use futures::StreamExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{PatchError, PatchResult};
use crate::patcher::PatchVariant;
use crate::platform::{self, ARCHIVE_NAME};
use crate::release::{ReleaseAsset, ReleaseInfo, ReleaseSource};

const GZ_SUFFIX: &str = ".gz";
const LOCK_FILE: &str = "asarmod.lock";

/// Progress callback: (bytes received, content length).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Pick the asset for a variant, preferring the gzipped upload.
pub fn resolve_asset(release: &ReleaseInfo, variant: PatchVariant) -> PatchResult<ReleaseAsset> {
    let base = variant.asset_name();
    let compressed = format!("{}{}", base, GZ_SUFFIX);

    release
        .assets
        .iter()
        .find(|a| a.name == compressed)
        .or_else(|| release.assets.iter().find(|a| a.name == base))
        .cloned()
        .ok_or_else(|| PatchError::AssetNotFound {
            variant: variant.to_string(),
            release: release.display_name().to_string(),
        })
}

/// Name of the decompressed working file for an asset.
pub fn working_name(asset_name: &str) -> &str {
    asset_name.strip_suffix(GZ_SUFFIX).unwrap_or(asset_name)
}

pub struct ArchiveCache {
    root: PathBuf,
}

impl ArchiveCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.cache/asarmod` (platform equivalent elsewhere)
    pub fn default_root() -> PatchResult<PathBuf> {
        dirs::cache_dir()
            .map(|dir| dir.join("asarmod"))
            .ok_or_else(|| PatchError::NotFound {
                what: "user cache directory".to_string(),
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn entry_path(&self, asset: &ReleaseAsset) -> PathBuf {
        self.temp_dir().join(&asset.name)
    }

    pub fn archive_backup_path(&self) -> PathBuf {
        self.temp_dir().join(format!("{}.backup", ARCHIVE_NAME))
    }

    /// A cache entry is valid if it exists with the declared size.
    pub fn is_valid(&self, asset: &ReleaseAsset) -> bool {
        fs::metadata(self.entry_path(asset))
            .map(|meta| meta.len() == asset.size)
            .unwrap_or(false)
    }

    /// Make the asset available locally and return the uncompressed archive.
    pub async fn ensure_local(
        &self,
        source: &dyn ReleaseSource,
        asset: &ReleaseAsset,
        use_cache: bool,
        token: Option<&str>,
        progress: ProgressFn<'_>,
    ) -> PatchResult<PathBuf> {
        let temp = self.temp_dir();
        fs::create_dir_all(&temp).map_err(|e| PatchError::fs(&temp, e))?;

        let entry = self.entry_path(asset);
        if use_cache && self.is_valid(asset) {
            info!("Using cached {} ({} bytes)", asset.name, asset.size);
            progress(asset.size, asset.size);
        } else {
            if use_cache && entry.exists() {
                warn!("Cached {} has the wrong size, downloading again", asset.name);
            }
            download_to(source, asset, &entry, token, progress).await?;
        }

        if asset.name.ends_with(GZ_SUFFIX) {
            let working = temp.join(working_name(&asset.name));
            gunzip(&entry, &working)?;
            Ok(working)
        } else {
            Ok(entry)
        }
    }

    /// Delete cached and working files. Backups go only with `include_backups`.
    pub fn clear(&self, include_backups: bool) -> PatchResult<usize> {
        let temp = self.temp_dir();
        let entries = match fs::read_dir(&temp) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PatchError::fs(&temp, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|e| PatchError::fs(&temp, e))?.path();
            if !path.is_file() {
                continue;
            }
            let is_backup = path.extension().map(|ext| ext == "backup").unwrap_or(false);
            if is_backup && !include_backups {
                continue;
            }
            fs::remove_file(&path).map_err(|e| PatchError::fs(&path, e))?;
            debug!("Removed {}", path.display());
            removed += 1;
        }

        Ok(removed)
    }

    /// Take the advisory run lock. A lock left by a dead process is replaced.
    pub fn lock(&self) -> PatchResult<RunLock> {
        fs::create_dir_all(&self.root).map_err(|e| PatchError::fs(&self.root, e))?;
        let path = self.root.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(|e| PatchError::fs(&path, e))?;
                    return Ok(RunLock { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    // No readable pid may be a holder that has not written it yet
                    let owner = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if pid != std::process::id() && !platform::pid_alive(pid) => {}
                        _ => return Err(PatchError::Busy { lock: path }),
                    }
                    warn!("Removing stale lock {}", path.display());
                    fs::remove_file(&path).map_err(|e| PatchError::fs(&path, e))?;
                }
                Err(e) => return Err(PatchError::fs(&path, e)),
            }
        }

        Err(PatchError::Busy { lock: path })
    }
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Stream an asset to disk, writing chunks in arrival order.
async fn download_to(
    source: &dyn ReleaseSource,
    asset: &ReleaseAsset,
    dest: &Path,
    token: Option<&str>,
    progress: ProgressFn<'_>,
) -> PatchResult<u64> {
    info!("Downloading {} ({} bytes)", asset.name, asset.size);
    let mut stream = source.download(&asset.download_url, token).await?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| PatchError::fs(dest, e))?;

    let mut received = 0u64;
    while let Some(chunk) = stream.chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await.map_err(|e| PatchError::fs(dest, e))?;
        received += chunk.len() as u64;

        if let Some(total) = stream.content_length {
            progress(received, total);
        }
    }
    file.flush().await.map_err(|e| PatchError::fs(dest, e))?;
    drop(file);

    if received != asset.size {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(PatchError::Download {
            url: asset.download_url.clone(),
            reason: format!("size mismatch: expected {} bytes, got {}", asset.size, received),
        });
    }

    debug!("Downloaded {} bytes to {}", received, dest.display());
    Ok(received)
}

fn gunzip(src: &Path, dest: &Path) -> PatchResult<u64> {
    let input = File::open(src).map_err(|e| PatchError::fs(src, e))?;
    let mut decoder = GzDecoder::new(input);
    let mut output = File::create(dest).map_err(|e| PatchError::fs(dest, e))?;

    let written = io::copy(&mut decoder, &mut output).map_err(|e| PatchError::Archive {
        path: src.to_path_buf(),
        reason: format!("gzip decode failed: {}", e),
    })?;
    output.flush().map_err(|e| PatchError::fs(dest, e))?;

    debug!("Decompressed {} -> {} ({} bytes)", src.display(), dest.display(), written);
    Ok(written)
}


#[cfg(test)]
mod tests {
    use super::fake::{gzip, FakeSource};
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn no_progress(_: u64, _: u64) {}

    #[test]
    fn test_resolve_prefers_compressed() {
        let source = FakeSource::new(vec![("app.asar", vec![1]), ("app.asar.gz", vec![2])]);
        let asset = resolve_asset(&source.release, PatchVariant::Default).unwrap();
        assert_eq!(asset.name, "app.asar.gz");

        let source = FakeSource::new(vec![("app.asar", vec![1])]);
        let asset = resolve_asset(&source.release, PatchVariant::Default).unwrap();
        assert_eq!(asset.name, "app.asar");
    }

    #[test]
    fn test_resolve_missing_variant() {
        let source = FakeSource::new(vec![("app.asar.gz", vec![1])]);
        let err = resolve_asset(&source.release, PatchVariant::DevtoolsOnly).unwrap_err();
        assert!(matches!(err, PatchError::AssetNotFound { .. }));
    }

    #[test]
    fn test_working_name() {
        assert_eq!(working_name("app.asar.gz"), "app.asar");
        assert_eq!(working_name("app-devtools.asar"), "app-devtools.asar");
    }

    #[tokio::test]
    async fn test_download_reports_progress_and_decompresses() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let payload = vec![9u8; 4000];
        let source = FakeSource::new(vec![("app.asar.gz", gzip(&payload))]);
        let asset = source.release.assets[0].clone();

        let seen = Mutex::new(Vec::new());
        let progress = |got: u64, total: u64| seen.lock().unwrap().push((got, total));
        let working = cache.ensure_local(&source, &asset, true, None, &progress).await.unwrap();

        assert_eq!(working, cache.temp_dir().join("app.asar"));
        assert_eq!(fs::read(&working).unwrap(), payload);
        assert_eq!(source.download_count(), 1);

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(*seen.last().unwrap(), (asset.size, asset.size));
    }

    #[tokio::test]
    async fn test_valid_cache_skips_network() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let source = FakeSource::new(vec![("app.asar", vec![5u8; 300])]);
        let asset = source.release.assets[0].clone();

        fs::create_dir_all(cache.temp_dir()).unwrap();
        fs::write(cache.entry_path(&asset), vec![5u8; 300]).unwrap();

        let path = cache.ensure_local(&source, &asset, true, None, &no_progress).await.unwrap();
        assert_eq!(path, cache.entry_path(&asset));
        assert_eq!(source.download_count(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_redownloads() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let source = FakeSource::new(vec![("app.asar", vec![5u8; 300])]);
        let asset = source.release.assets[0].clone();

        fs::create_dir_all(cache.temp_dir()).unwrap();
        fs::write(cache.entry_path(&asset), vec![5u8; 10]).unwrap();

        cache.ensure_local(&source, &asset, true, None, &no_progress).await.unwrap();
        assert_eq!(source.download_count(), 1);
        assert_eq!(fs::metadata(cache.entry_path(&asset)).unwrap().len(), 300);
    }

    #[tokio::test]
    async fn test_cache_disabled_always_downloads() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let source = FakeSource::new(vec![("app.asar", vec![5u8; 300])]);
        let asset = source.release.assets[0].clone();

        cache.ensure_local(&source, &asset, false, None, &no_progress).await.unwrap();
        cache.ensure_local(&source, &asset, false, None, &no_progress).await.unwrap();
        assert_eq!(source.download_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_content_length_skips_progress() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let mut source = FakeSource::new(vec![("app.asar", vec![5u8; 1000])]);
        source.send_length = false;
        let asset = source.release.assets[0].clone();

        let calls = Mutex::new(0usize);
        let progress = |_: u64, _: u64| *calls.lock().unwrap() += 1;
        cache.ensure_local(&source, &asset, false, None, &progress).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(fs::metadata(cache.entry_path(&asset)).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_short_download_fails() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let source = FakeSource::new(vec![("app.asar", vec![5u8; 100])]);
        let mut asset = source.release.assets[0].clone();
        asset.size = 200;

        let err = cache.ensure_local(&source, &asset, false, None, &no_progress).await.unwrap_err();
        assert!(matches!(err, PatchError::Download { .. }));
        assert!(!cache.entry_path(&asset).exists());
    }

    #[test]
    fn test_clear_keeps_backups_unless_asked() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        fs::create_dir_all(cache.temp_dir()).unwrap();
        fs::write(cache.temp_dir().join("app.asar.gz"), b"x").unwrap();
        fs::write(cache.temp_dir().join("app.asar"), b"x").unwrap();
        fs::write(cache.archive_backup_path(), b"x").unwrap();

        assert_eq!(cache.clear(false).unwrap(), 2);
        assert!(cache.archive_backup_path().exists());

        assert_eq!(cache.clear(true).unwrap(), 1);
        assert!(!cache.archive_backup_path().exists());
    }

    #[test]
    fn test_clear_without_temp_dir() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path().join("never-created"));
        assert_eq!(cache.clear(true).unwrap(), 0);
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let lock_path = temp.path().join(LOCK_FILE);

        {
            let _lock = cache.lock().unwrap();
            assert!(lock_path.exists());
            assert!(matches!(cache.lock(), Err(PatchError::Busy { .. })));
        }
        assert!(!lock_path.exists());
        assert!(cache.lock().is_ok());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        // Not a valid pid on any supported OS
        fs::write(temp.path().join(LOCK_FILE), "4294967290").unwrap();

        let lock = cache.lock();
        assert!(lock.is_ok());
    }

    #[test]
    fn test_unreadable_lock_is_busy() {
        let temp = tempdir().unwrap();
        let cache = ArchiveCache::new(temp.path());
        let lock_path = temp.path().join(LOCK_FILE);

        for content in ["", "not-a-pid"] {
            fs::write(&lock_path, content).unwrap();
            assert!(matches!(cache.lock(), Err(PatchError::Busy { .. })));
            assert_eq!(fs::read_to_string(&lock_path).unwrap(), content);
        }
    }
}
