//! Stopping and restarting the target application.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

use crate::platform::{PlatformBackend, PlatformProfile};

/// Delay after terminating so file locks on the archive are released.
pub const GRACE_DELAY: Duration = Duration::from_secs(2);

/// Result of looking for running instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessListing {
    Found(Vec<u32>),
    /// The enumeration tool is not installed.
    NotAvailable(String),
    /// The tool ran but failed.
    Failed(String),
}

impl ProcessListing {
    /// Pids to act on. Enumeration problems count as "nothing running".
    pub fn pids(&self) -> &[u32] {
        match self {
            ProcessListing::Found(pids) => pids,
            _ => &[],
        }
    }
}

/// Run an enumeration command, mapping spawn failures to `NotAvailable`.
pub(crate) fn run_tool(cmd: &mut Command) -> Result<Output, ProcessListing> {
    cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcessListing::NotAvailable(format!("{:?} not found", cmd.get_program()))
        } else {
            ProcessListing::Failed(e.to_string())
        }
    })
}

/// Whether a process is an instance of `binary`: its executable image, or
/// failing that its argv[0], must be exactly that path.
pub(crate) fn is_instance(binary: &Path, exe: Option<&Path>, argv0: Option<&OsStr>) -> bool {
    if let Some(exe) = exe {
        if exe == binary {
            return true;
        }
    }
    argv0.map(|arg| Path::new(arg) == binary).unwrap_or(false)
}

/// Running processes started from `binary`, this process excluded.
///
/// Paths are compared for equality, never as patterns, so characters like
/// `(` or `+` in the install root need no escaping and files that merely
/// live under the install root do not match.
pub(crate) fn find_by_executable(binary: &Path) -> ProcessListing {
    let canonical = binary.canonicalize().ok();
    let own = Pid::from_u32(std::process::id());

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet),
    );

    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(pid, _)| **pid != own)
        .filter(|(_, process)| {
            let argv0 = process.cmd().first().map(|a| a.as_os_str());
            is_instance(binary, process.exe(), argv0)
                || canonical
                    .as_deref()
                    .map(|c| is_instance(c, process.exe(), argv0))
                    .unwrap_or(false)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();

    debug!("Processes running {}: {:?}", binary.display(), pids);
    ProcessListing::Found(pids)
}

pub struct ProcessController<'a> {
    backend: &'a dyn PlatformBackend,
    grace: Duration,
}

impl<'a> ProcessController<'a> {
    pub fn new(backend: &'a dyn PlatformBackend) -> Self {
        Self {
            backend,
            grace: GRACE_DELAY,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn list_running(&self, profile: &PlatformProfile) -> ProcessListing {
        let listing = self.backend.list_processes(profile);
        match &listing {
            ProcessListing::Found(pids) => debug!("Running instances: {:?}", pids),
            ProcessListing::NotAvailable(reason) | ProcessListing::Failed(reason) => {
                warn!("Could not enumerate processes ({}), assuming none running", reason)
            }
        }
        listing
    }

    /// Signal every pid, then wait the grace delay. Does not confirm exit.
    pub async fn terminate(&self, pids: &[u32]) {
        for &pid in pids {
            if self.backend.terminate(pid) {
                info!("Sent termination to pid {}", pid);
            } else {
                debug!("Could not signal pid {} (already exited?)", pid);
            }
        }
        tokio::time::sleep(self.grace).await;
    }

    pub fn relaunch(&self, profile: &PlatformProfile) -> std::io::Result<()> {
        info!("Relaunching {}", profile.install_root.display());
        self.backend.launch(profile)
    }
}
