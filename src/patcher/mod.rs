//! Patch orchestrator
//!
//! Coordinates one patch run:
//! 1. Verify Install    — archive is read/write accessible, its directory writable
//! 2. Check Processes   — refuse, or stop running instances with --force
//! 3. Fetch Metadata    — latest release, pick the variant's asset
//! 4. Download Asset    — cached or streamed, gunzipped
//! 5. Backup            — copy the live archive to the cache
//! 6. Replace           — swap in the working archive
//! 7. Patch Integrity   — exe fingerprint rewrite / bundle re-sign
//! 8. Clear Cache       — unless --keep-cache
//! 9. Relaunch          — only if we stopped it
//!
//! A failure after Replace restores the archive from the backup taken in
//! this run, and reverts the executable if it was rewritten, before the
//! error is returned.

pub mod config;

pub use config::{PatchRequest, PatchVariant};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::asar;
use crate::cache::{self, ArchiveCache};
use crate::error::{PatchError, PatchResult};
use crate::fsutil::{check_dir_writable, check_read_write, replace_file};
use crate::integrity::{self, Fingerprint, IntegrityOutcome};
use crate::platform::{PlatformBackend, PlatformProfile};
use crate::process::{ProcessController, ProcessListing, GRACE_DELAY};
use crate::release::{ReleaseInfo, ReleaseSource};

/// Progress callback for reporting patch status
pub type EventCallback = Arc<dyn Fn(PatchEvent) + Send + Sync>;

/// Patch run phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchPhase {
    VerifyInstall,
    CheckProcesses,
    StopProcess,
    FetchMetadata,
    DownloadAsset,
    Backup,
    Replace,
    PatchIntegrity,
    ClearCache,
    Relaunch,
    Done,
}

impl PatchPhase {
    pub fn name(self) -> &'static str {
        match self {
            PatchPhase::VerifyInstall => "Verify Install",
            PatchPhase::CheckProcesses => "Check Processes",
            PatchPhase::StopProcess => "Stop Process",
            PatchPhase::FetchMetadata => "Fetch Release",
            PatchPhase::DownloadAsset => "Download Asset",
            PatchPhase::Backup => "Backup",
            PatchPhase::Replace => "Replace Archive",
            PatchPhase::PatchIntegrity => "Patch Integrity",
            PatchPhase::ClearCache => "Clear Cache",
            PatchPhase::Relaunch => "Relaunch",
            PatchPhase::Done => "Done",
        }
    }
}

/// Progress information
#[derive(Debug, Clone, PartialEq)]
pub enum PatchEvent {
    Phase(PatchPhase),
    Download { received: u64, total: u64 },
    /// Non-fatal condition; the run continues
    Warning(String),
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct PatchReport {
    pub release: String,
    pub asset: String,
    pub fingerprint_before: Option<Fingerprint>,
    pub fingerprint_after: Option<Fingerprint>,
    pub integrity: IntegrityOutcome,
    pub stopped: Vec<u32>,
    pub relaunched: bool,
}

/// Version info of the installed app, read from `package.json` in the archive
#[derive(Debug, Clone)]
pub struct InstalledMetadata {
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub fingerprint: Fingerprint,
    pub name: Option<String>,
    pub product_name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    name: Option<String>,
    product_name: Option<String>,
    version: Option<String>,
    description: Option<String>,
}

/// Main patch orchestrator
pub struct Patcher {
    request: PatchRequest,
    backend: Box<dyn PlatformBackend>,
    source: Box<dyn ReleaseSource>,
    cache: ArchiveCache,
    events: Option<EventCallback>,
    grace: Duration,
}

impl Patcher {
    pub fn new(
        request: PatchRequest,
        backend: Box<dyn PlatformBackend>,
        source: Box<dyn ReleaseSource>,
        cache: ArchiveCache,
    ) -> Self {
        Self {
            request,
            backend,
            source,
            cache,
            events: None,
            grace: GRACE_DELAY,
        }
    }

    pub fn with_events(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Override the post-termination delay.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn request(&self) -> &PatchRequest {
        &self.request
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    fn emit(&self, event: PatchEvent) {
        if let Some(ref callback) = self.events {
            callback(event);
        }
    }

    fn phase(&self, phase: PatchPhase) {
        info!("Phase: {}", phase.name());
        self.emit(PatchEvent::Phase(phase));
    }

    fn warning(&self, message: String) {
        warn!("{}", message);
        self.emit(PatchEvent::Warning(message));
    }

    fn controller(&self) -> ProcessController<'_> {
        ProcessController::new(self.backend.as_ref()).with_grace(self.grace)
    }

    /// Resolve the install and require the archive to exist.
    fn locate(&self) -> PatchResult<PlatformProfile> {
        let profile = self.backend.resolve(self.request.install_root.as_deref())?;

        if !profile.archive_path.is_file() {
            return Err(PatchError::InstallNotFound {
                path: profile.archive_path.clone(),
            });
        }
        Ok(profile)
    }

    /// Resolve the install and make sure the archive can be replaced.
    pub fn check_install_possible(&self) -> PatchResult<PlatformProfile> {
        let profile = self.locate()?;
        check_read_write(&profile.archive_path)?;
        if let Some(dir) = profile.archive_path.parent() {
            check_dir_writable(dir)?;
        }

        Ok(profile)
    }

    pub fn installed_metadata(&self) -> PatchResult<InstalledMetadata> {
        let profile = self.locate()?;
        let archive = &profile.archive_path;

        let header = asar::read_header(archive)?;
        let package: PackageJson = match header.read_file(archive, "package.json") {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PatchError::Archive {
                path: archive.clone(),
                reason: format!("package.json: {}", e),
            })?,
            Err(PatchError::NotFound { what }) => {
                debug!("No metadata: {}", what);
                PackageJson::default()
            }
            Err(e) => return Err(e),
        };

        let archive_size = fs::metadata(archive).map_err(|e| PatchError::fs(archive, e))?.len();

        Ok(InstalledMetadata {
            archive_path: archive.clone(),
            archive_size,
            fingerprint: Fingerprint::of_header(&header.json),
            name: package.name,
            product_name: package.product_name,
            version: package.version,
            description: package.description,
        })
    }

    pub async fn fetch_release_info(&self) -> PatchResult<ReleaseInfo> {
        self.source.latest_release(self.request.token()).await
    }

    pub fn clear_caches(&self, include_backups: bool) -> PatchResult<usize> {
        let removed = self.cache.clear(include_backups)?;
        info!("Removed {} cached file(s)", removed);
        Ok(removed)
    }

    /// Process gate shared by patch and restore. Returns the pids stopped.
    async fn stop_running(&self, profile: &PlatformProfile) -> PatchResult<Vec<u32>> {
        self.phase(PatchPhase::CheckProcesses);
        let controller = self.controller();
        let listing = controller.list_running(profile);
        if let ProcessListing::NotAvailable(reason) | ProcessListing::Failed(reason) = &listing {
            self.emit(PatchEvent::Warning(format!(
                "Could not check for running instances: {}",
                reason
            )));
        }

        let pids = listing.pids().to_vec();
        if pids.is_empty() {
            return Ok(pids);
        }
        if !self.request.force_stop {
            return Err(PatchError::ProcessRunning { pids });
        }

        self.phase(PatchPhase::StopProcess);
        controller.terminate(&pids).await;
        Ok(pids)
    }

    fn relaunch_if_stopped(&self, profile: &PlatformProfile, stopped: &[u32]) -> bool {
        if stopped.is_empty() || !self.request.relaunch {
            return false;
        }

        self.phase(PatchPhase::Relaunch);
        match self.controller().relaunch(profile) {
            Ok(()) => true,
            Err(e) => {
                self.warning(format!("Failed to relaunch: {}", e));
                false
            }
        }
    }

    /// Run the full patch.
    pub async fn patch(&self) -> PatchResult<PatchReport> {
        let started = Instant::now();
        let _lock = self.cache.lock()?;

        self.phase(PatchPhase::VerifyInstall);
        let profile = self.check_install_possible()?;
        info!("Archive: {}", profile.archive_path.display());

        let stopped = self.stop_running(&profile).await?;

        self.phase(PatchPhase::FetchMetadata);
        let release = self.source.latest_release(self.request.token()).await?;
        let asset = cache::resolve_asset(&release, self.request.variant)?;
        info!("Release {} asset {} ({} bytes)", release.display_name(), asset.name, asset.size);

        self.phase(PatchPhase::DownloadAsset);
        let progress = |received: u64, total: u64| self.emit(PatchEvent::Download { received, total });
        let working = self
            .cache
            .ensure_local(
                self.source.as_ref(),
                &asset,
                self.request.use_cache,
                self.request.token(),
                &progress,
            )
            .await?;

        let tracks = self.backend.tracks_fingerprint();
        let before = self.fingerprint_if(tracks, &profile)?;

        self.phase(PatchPhase::Backup);
        let backup = self.cache.archive_backup_path();
        fs::copy(&profile.archive_path, &backup).map_err(|e| PatchError::fs(&backup, e))?;
        debug!("Backed up archive to {}", backup.display());

        self.phase(PatchPhase::Replace);
        replace_file(&working, &profile.archive_path)?;

        let after = match self.fingerprint_if(tracks, &profile) {
            Ok(after) => after,
            Err(e) => {
                self.rollback(&profile, &backup, None);
                return Err(e);
            }
        };
        let outcome = match self.bypass(&profile, before.as_ref(), after.as_ref()) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback(&profile, &backup, before.as_ref().zip(after.as_ref()));
                return Err(e);
            }
        };

        if !self.request.keep_cache {
            self.phase(PatchPhase::ClearCache);
            if let Err(e) = self.cache.clear(false) {
                self.warning(format!("Failed to clear cache: {}", e));
            }
        }

        let relaunched = self.relaunch_if_stopped(&profile, &stopped);

        self.phase(PatchPhase::Done);
        info!("Patch finished in {} ms", started.elapsed().as_millis());

        Ok(PatchReport {
            release: release.display_name().to_string(),
            asset: asset.name,
            fingerprint_before: before,
            fingerprint_after: after,
            integrity: outcome,
            stopped,
            relaunched,
        })
    }

    fn fingerprint_if(&self, tracks: bool, profile: &PlatformProfile) -> PatchResult<Option<Fingerprint>> {
        if tracks {
            integrity::fingerprint(&profile.archive_path).map(Some)
        } else {
            Ok(None)
        }
    }

    fn bypass(
        &self,
        profile: &PlatformProfile,
        before: Option<&Fingerprint>,
        after: Option<&Fingerprint>,
    ) -> PatchResult<IntegrityOutcome> {
        self.phase(PatchPhase::PatchIntegrity);
        let outcome = self.backend.apply_integrity_bypass(profile, before, after)?;
        self.report_outcome(&outcome);
        Ok(outcome)
    }

    fn report_outcome(&self, outcome: &IntegrityOutcome) {
        match outcome {
            IntegrityOutcome::MarkerNotFound => {
                self.emit(PatchEvent::Warning(
                    "Integrity fingerprint not found in executable (already patched?)".to_string(),
                ));
            }
            IntegrityOutcome::ExecutableMissing => {
                self.emit(PatchEvent::Warning("Executable not found, integrity not patched".to_string()));
            }
            IntegrityOutcome::ResignFailed(reason) => {
                self.emit(PatchEvent::Warning(format!("Re-signing failed: {}", reason)));
            }
            _ => {}
        }
    }

    /// Restore the archive from this run's backup. With `fingerprints`
    /// (before, after) the integrity step is also run in reverse, which puts
    /// a rewritten executable back and leaves an untouched one alone.
    fn rollback(
        &self,
        profile: &PlatformProfile,
        backup: &Path,
        fingerprints: Option<(&Fingerprint, &Fingerprint)>,
    ) {
        error!("Patch failed after replacing the archive, restoring backup");
        if let Err(e) = replace_file(backup, &profile.archive_path) {
            error!(
                "Restore failed ({}); backup is kept at {}",
                e,
                backup.display()
            );
            return;
        }

        if let Some((before, after)) = fingerprints {
            match self
                .backend
                .apply_integrity_bypass(profile, Some(after), Some(before))
            {
                Ok(outcome) => debug!("Integrity rollback: {:?}", outcome),
                Err(e) => error!("Could not revert the executable: {}", e),
            }
        }
    }

    /// Put the backed-up archive back and re-align the integrity check with it.
    pub async fn restore(&self) -> PatchResult<PlatformProfile> {
        let _lock = self.cache.lock()?;

        self.phase(PatchPhase::VerifyInstall);
        let profile = self.check_install_possible()?;
        let backup = self.cache.archive_backup_path();
        if !backup.is_file() {
            return Err(PatchError::BackupNotFound { path: backup });
        }

        let stopped = self.stop_running(&profile).await?;

        let tracks = self.backend.tracks_fingerprint();
        let before = self.fingerprint_if(tracks, &profile)?;

        self.phase(PatchPhase::Replace);
        replace_file(&backup, &profile.archive_path)?;
        info!("Restored {} from {}", profile.archive_path.display(), backup.display());

        let after = self.fingerprint_if(tracks, &profile)?;
        self.bypass(&profile, before.as_ref(), after.as_ref())?;
        self.relaunch_if_stopped(&profile, &stopped);
        self.phase(PatchPhase::Done);

        Ok(profile)
    }
}
