//! asarmod - swaps an Electron app's `app.asar` for a modded build
//!
//! Fetches the archive from a GitHub release, replaces the installed one and
//! gets it past the app's integrity check.

pub mod asar;
pub mod cache;
pub mod error;
mod fsutil;
pub mod integrity;
pub mod patcher;
pub mod platform;
pub mod process;
pub mod release;
pub mod settings;

pub use error::{ErrorKind, PatchError, PatchResult};
pub use patcher::{PatchEvent, PatchPhase, PatchReport, PatchRequest, PatchVariant, Patcher};
pub use platform::{current_backend, Platform, PlatformBackend, PlatformProfile};
pub use release::{GithubReleases, ReleaseSource};
