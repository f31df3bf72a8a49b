//! asarmod - swaps an Electron app's `app.asar` for a modded build

use anyhow::Result;
use asarmod::cache::ArchiveCache;
use asarmod::integrity::IntegrityOutcome;
use asarmod::release::{GithubReleases, RELEASE_REPO};
use asarmod::settings::{SettingKey, Settings};
use asarmod::{current_backend, PatchError, PatchEvent, PatchPhase, PatchRequest, PatchVariant, Patcher};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asarmod")]
#[command(version)]
#[command(about = "Patch Sidekick's app.asar with a modded build and bypass its integrity check")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Options shared by commands that touch the install
#[derive(Args)]
struct InstallArgs {
    /// Install root (defaults to the platform location or the saved custom_path)
    #[arg(short, long)]
    path: Option<PathBuf>,
}

#[derive(Args)]
struct StopArgs {
    /// Stop a running instance instead of refusing
    #[arg(short, long)]
    force: bool,

    /// Do not start the app again after stopping it
    #[arg(long)]
    no_relaunch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the latest modded archive and install it
    Patch {
        /// Archive variant: default or devtools
        #[arg(long, default_value = "default")]
        variant: PatchVariant,

        #[command(flatten)]
        install: InstallArgs,

        #[command(flatten)]
        stop: StopArgs,

        /// Always download, ignoring a cached copy
        #[arg(long)]
        no_cache: bool,

        /// Keep downloaded files after patching
        #[arg(long)]
        keep_cache: bool,

        /// GitHub token (raises the API rate limit)
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Check that the install can be patched
    Check {
        #[command(flatten)]
        install: InstallArgs,
    },

    /// Show the installed app's version and archive fingerprint
    Info {
        #[command(flatten)]
        install: InstallArgs,
    },

    /// Show the latest release and its assets
    Release {
        /// GitHub token (raises the API rate limit)
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Delete downloaded archives
    ClearCache {
        /// Also delete the archive backup
        #[arg(long)]
        all: bool,
    },

    /// Put the backed-up archive back
    Restore {
        #[command(flatten)]
        install: InstallArgs,

        #[command(flatten)]
        stop: StopArgs,
    },

    /// Read or change saved settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one setting, or all of them
    Get { key: Option<SettingKey> },
    /// Save a setting
    Set { key: SettingKey, value: String },
    /// Remove a setting
    Unset { key: SettingKey },
}

fn build_patcher(request: PatchRequest) -> Result<Patcher> {
    let settings = Settings::load();
    let request = request.with_settings(&settings);
    let backend = current_backend()?;
    let source = GithubReleases::new(RELEASE_REPO)?;
    let cache = ArchiveCache::new(ArchiveCache::default_root()?);
    Ok(Patcher::new(request, backend, Box::new(source), cache))
}

/// Progress bar that follows patch events
fn progress_reporter() -> Result<(ProgressBar, Arc<dyn Fn(PatchEvent) + Send + Sync>)> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}")?
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let bar = pb.clone();
    let callback: Arc<dyn Fn(PatchEvent) + Send + Sync> = Arc::new(move |event: PatchEvent| match event {
        PatchEvent::Phase(PatchPhase::Done) => bar.finish_and_clear(),
        PatchEvent::Phase(phase) => bar.set_message(phase.name()),
        PatchEvent::Download { received, total } => {
            bar.set_length(total);
            bar.set_position(received);
        }
        PatchEvent::Warning(message) => bar.println(format!("warning: {}", message)),
    });

    Ok((pb, callback))
}

fn print_outcome(outcome: &IntegrityOutcome) {
    match outcome {
        IntegrityOutcome::Patched { replaced } => {
            println!("Integrity:   executable patched ({} occurrence(s))", replaced)
        }
        IntegrityOutcome::Unchanged => println!("Integrity:   fingerprint unchanged"),
        IntegrityOutcome::MarkerNotFound => println!("Integrity:   fingerprint not found in executable"),
        IntegrityOutcome::ExecutableMissing => println!("Integrity:   executable missing"),
        IntegrityOutcome::Resigned => println!("Integrity:   bundle re-signed"),
        IntegrityOutcome::ResignFailed(reason) => println!("Integrity:   re-sign failed ({})", reason),
        IntegrityOutcome::NotApplicable => println!("Integrity:   not required on this platform"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Patch {
            variant,
            install,
            stop,
            no_cache,
            keep_cache,
            token,
        } => {
            let request = PatchRequest {
                variant,
                install_root: install.path,
                use_cache: !no_cache,
                keep_cache,
                token,
                force_stop: stop.force,
                relaunch: !stop.no_relaunch,
            };

            let (pb, events) = progress_reporter()?;
            let patcher = build_patcher(request)?.with_events(events);
            let result = patcher.patch().await;
            pb.finish_and_clear();
            let report = result?;

            println!("=== Patch Complete ===");
            println!("Release:     {}", report.release);
            println!("Asset:       {}", report.asset);
            if let (Some(before), Some(after)) = (&report.fingerprint_before, &report.fingerprint_after) {
                println!("Fingerprint: {} -> {}", before, after);
            }
            print_outcome(&report.integrity);
            if report.integrity.modified_executable() {
                println!("             original executable saved as <exe>.backup");
            }
            if !report.stopped.is_empty() {
                println!(
                    "Stopped:     {:?}{}",
                    report.stopped,
                    if report.relaunched { " (relaunched)" } else { "" }
                );
            }
        }

        Commands::Check { install } => {
            let patcher = build_patcher(PatchRequest {
                install_root: install.path,
                ..Default::default()
            })?;
            let profile = patcher.check_install_possible()?;

            println!("Platform:    {}", profile.platform);
            println!("Install:     {}", profile.install_root.display());
            println!("Archive:     {}", profile.archive_path.display());
            if let Some(exe) = &profile.executable_path {
                println!("Executable:  {}", exe.display());
            }
            println!("\nInstall can be patched.");
        }

        Commands::Info { install } => {
            let patcher = build_patcher(PatchRequest {
                install_root: install.path,
                ..Default::default()
            })?;
            let meta = patcher.installed_metadata()?;

            println!("=== Installed App ===");
            println!("Name:        {}", meta.product_name.or(meta.name).unwrap_or_else(|| "-".to_string()));
            println!("Version:     {}", meta.version.unwrap_or_else(|| "-".to_string()));
            if let Some(description) = meta.description {
                println!("Description: {}", description);
            }
            println!("Archive:     {}", meta.archive_path.display());
            println!("Size:        {:.2} MB", meta.archive_size as f64 / 1024.0 / 1024.0);
            println!("Fingerprint: {}", meta.fingerprint);
        }

        Commands::Release { token } => {
            let patcher = build_patcher(PatchRequest {
                token,
                ..Default::default()
            })?;
            let release = patcher.fetch_release_info().await?;

            println!("=== Latest Release ===");
            println!("Name:        {}", release.display_name());
            println!("Tag:         {}", release.tag_name);
            if let Some(published) = release.published_at {
                println!("Published:   {}", published.format("%Y-%m-%d %H:%M UTC"));
            }
            println!("\nAssets:");
            for asset in &release.assets {
                println!("{:>12}  {}", asset.size, asset.name);
            }
        }

        Commands::ClearCache { all } => {
            let cache = ArchiveCache::new(ArchiveCache::default_root()?);
            let removed = cache.clear(all)?;
            println!("Removed {} file(s) from {}", removed, cache.temp_dir().display());
        }

        Commands::Restore { install, stop } => {
            let patcher = build_patcher(PatchRequest {
                install_root: install.path,
                force_stop: stop.force,
                relaunch: !stop.no_relaunch,
                ..Default::default()
            })?;
            let profile = patcher.restore().await?;
            println!("Restored {}", profile.archive_path.display());
        }

        Commands::Config { action } => {
            let mut settings = Settings::load();
            match action {
                ConfigAction::Get { key: Some(key) } => {
                    println!("{}", settings.get(key).unwrap_or_default());
                }
                ConfigAction::Get { key: None } => {
                    for key in [SettingKey::GithubToken, SettingKey::CustomPath] {
                        let value = match (key, settings.get(key)) {
                            (SettingKey::GithubToken, Some(_)) => "(set)".to_string(),
                            (_, Some(value)) => value,
                            (_, None) => "(unset)".to_string(),
                        };
                        println!("{:<14}{}", key.as_str(), value);
                    }
                }
                ConfigAction::Set { key, value } => {
                    settings.set(key, &value);
                    settings.save()?;
                    println!("Saved {}", key.as_str());
                }
                ConfigAction::Unset { key } => {
                    settings.set(key, "");
                    settings.save()?;
                    println!("Removed {}", key.as_str());
                }
            }
            println!("Settings file: {}", Settings::settings_path()?.display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "asarmod=debug".parse()? } else { "asarmod=warn".parse()? }),
            )
            .init();
    }

    let result = run(cli).await;
    if let Err(e) = &result {
        if let Some(hint) = e.downcast_ref::<PatchError>().and_then(|pe| pe.kind().hint()) {
            eprintln!("hint: {}", hint);
        }
    }
    result
}
