use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;

mod bridge;
mod download;
mod env;
mod manifest;
mod mods;
mod resolver;
mod sources;
mod util;

use bridge::{PassKind, PassOutcome, UpdatePass};
use download::{Downloader, CANCELLED};
use manifest::{EntryState, Manifest, ManifestDiffEntry};
use mods::ModDescriptor;
use resolver::{ResolutionResult, Resolver};
use sources::UpdateCandidate;
use util::cancel_requested;

/// Timestamp of the last completed update check, stored in the mods root.
const CHECK_STAMP_FILE: &str = ".last-update-check";

#[derive(Parser, Debug)]
#[command(
    name = "sadx-mod-updater",
    author,
    version,
    about = "Update checker and integrity verifier for SADX mods"
)]
struct Cli {
    /// Game directory containing the mods folder.
    #[arg(long, default_value = ".")]
    game_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check all configured mods for available updates.
    Check {
        /// Download discovered updates after the check.
        #[arg(long)]
        download: bool,
        /// Skip the check if one completed within the last N hours.
        #[arg(long, default_value_t = 0)]
        cooldown: u64,
    },
    /// Verify each mod's files against its reference manifest.
    Verify,
    /// Verify, then re-download only the files that failed.
    Repair,
    /// Scan mod directories and write fresh reference manifests.
    Generate {
        /// Mod directory name; omitted, every mod's manifest is rebuilt.
        #[arg(long = "mod")]
        mod_name: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to create Tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Ctrl-C only records the request; the supervising loop forwards it
    // to the running pass at its next poll.
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping at the next checkpoint");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let result = match cli.command {
        Command::Check { download, cooldown } => {
            cmd_check(&runtime, &cli.game_dir, download, cooldown, interrupt)
        }
        Command::Verify => cmd_verify(&runtime, &cli.game_dir).map(|_| ()),
        Command::Repair => cmd_repair(&runtime, &cli.game_dir, interrupt),
        Command::Generate { mod_name } => {
            cmd_generate(&runtime, &cli.game_dir, mod_name.as_deref())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_check(
    runtime: &Runtime,
    game_dir: &Path,
    download: bool,
    cooldown_hours: u64,
    interrupt: Arc<AtomicBool>,
) -> Result<(), String> {
    let mods_root = env::mods_root(game_dir);
    if check_on_cooldown(&mods_root, cooldown_hours) {
        println!("Update check ran recently; use --cooldown 0 to force one.");
        return Ok(());
    }

    let mod_set = runtime.block_on(mods::load_mod_set(&mods_root))?;
    if mod_set.is_empty() {
        println!("No mods found under {}.", mods_root.display());
        return Ok(());
    }

    let resolver = Resolver::new(mods_root.clone());
    let cancel = Arc::new(AtomicBool::new(false));
    let pass_cancel = cancel.clone();
    let mod_count = mod_set.len();
    let pass = UpdatePass::spawn(runtime, PassKind::VersionCheck, cancel, async move {
        resolver.resolve(&mod_set, &pass_cancel).await
    });

    let spinner = checking_spinner(&format!("Checking {mod_count} mod(s) for updates"));
    debug!("supervising {:?} pass", pass.kind());
    let outcome = pass.supervise(runtime, |pass| {
        if interrupt.load(Ordering::SeqCst) && !pass.cancel_requested() {
            pass.request_cancel();
        }
    });
    spinner.finish_and_clear();

    match outcome {
        PassOutcome::Cancelled => {
            println!("Update check cancelled.");
            Ok(())
        }
        PassOutcome::Completed(result) => {
            write_check_stamp(&mods_root);
            report_result(&result);
            if download && !result.updates.is_empty() {
                download_all(runtime, &mods_root, &result.updates, &interrupt)?;
                env::clear_staging_if_empty(&mods_root);
            }
            Ok(())
        }
    }
}

/// Scan every mod that carries a manifest and report how it diverges.
/// Returns the mods that failed together with their diffs, ready to feed
/// the repair pass.
fn cmd_verify(
    runtime: &Runtime,
    game_dir: &Path,
) -> Result<Vec<(ModDescriptor, Vec<ManifestDiffEntry>)>, String> {
    let mods_root = env::mods_root(game_dir);
    let mod_set = runtime.block_on(mods::load_mod_set(&mods_root))?;

    let mut failed = Vec::new();
    let mut verified = 0usize;
    for mod_info in mod_set {
        let reference = match runtime.block_on(Manifest::load(&mod_info.manifest_path(&mods_root)))
        {
            Ok(Some(reference)) => reference,
            Ok(None) => continue,
            Err(err) => {
                println!("{}: manifest unreadable ({err})", mod_info.name);
                continue;
            }
        };
        verified += 1;

        let local = match manifest::scan_directory(&mod_info.mod_dir(&mods_root)) {
            Ok(local) => local,
            Err(err) => {
                println!("{}: scan failed ({err})", mod_info.name);
                continue;
            }
        };

        let diff = manifest::diff(&local, &reference);
        let divergent = diff.iter().filter(|d| d.state != EntryState::Unchanged).count();
        if divergent == 0 {
            println!("{}: ok", mod_info.name);
            continue;
        }

        println!("{}: {divergent} file(s) differ", mod_info.name);
        for state in [EntryState::Added, EntryState::Modified, EntryState::Removed] {
            for entry in diff.iter().filter(|d| d.state == state) {
                match (&entry.local, &entry.reference) {
                    (Some(local), Some(reference)) if local.size != reference.size => {
                        println!(
                            "  {state}: {} ({} -> {} bytes)",
                            entry.path, local.size, reference.size
                        );
                    }
                    _ => println!("  {state}: {}", entry.path),
                }
            }
        }
        failed.push((mod_info, diff));
    }

    if verified == 0 {
        println!("None of the installed mods have manifests, so they cannot be verified.");
    } else if failed.is_empty() {
        println!("All mods with manifests passed verification.");
    }
    Ok(failed)
}

fn cmd_repair(
    runtime: &Runtime,
    game_dir: &Path,
    interrupt: Arc<AtomicBool>,
) -> Result<(), String> {
    let failed = cmd_verify(runtime, game_dir)?;
    if failed.is_empty() {
        return Ok(());
    }

    let mods_root = env::mods_root(game_dir);
    let resolver = Resolver::new(mods_root.clone());
    let cancel = Arc::new(AtomicBool::new(false));
    let pass_cancel = cancel.clone();
    let pass = UpdatePass::spawn(runtime, PassKind::Repair, cancel, async move {
        resolver.resolve_forced(failed, &pass_cancel).await
    });

    let spinner = checking_spinner("Preparing repair downloads");
    debug!("supervising {:?} pass", pass.kind());
    let outcome = pass.supervise(runtime, |pass| {
        if interrupt.load(Ordering::SeqCst) && !pass.cancel_requested() {
            pass.request_cancel();
        }
    });
    spinner.finish_and_clear();

    match outcome {
        PassOutcome::Cancelled => {
            println!("Repair cancelled.");
            Ok(())
        }
        PassOutcome::Completed(result) => {
            report_result(&result);
            if !result.updates.is_empty() {
                download_all(runtime, &mods_root, &result.updates, &interrupt)?;
                env::clear_staging_if_empty(&mods_root);
            }
            // The repair handle is consumed here; the next pass starts
            // back in version-check mode.
            info!("repair pass finished");
            Ok(())
        }
    }
}

/// Build a reference manifest from what is actually on disk, replacing
/// any existing one. This is how a mod acquires its first mod.manifest.
fn cmd_generate(
    runtime: &Runtime,
    game_dir: &Path,
    mod_name: Option<&str>,
) -> Result<(), String> {
    let mods_root = env::mods_root(game_dir);
    let mut mod_set = runtime.block_on(mods::load_mod_set(&mods_root))?;
    if let Some(name) = mod_name {
        mod_set.retain(|m| m.dir_key == name);
        if mod_set.is_empty() {
            return Err(format!(
                "no mod directory named {name} under {}",
                mods_root.display()
            ));
        }
    }
    if mod_set.is_empty() {
        println!("No mods found under {}.", mods_root.display());
        return Ok(());
    }

    for mod_info in mod_set {
        let scanned = manifest::scan_directory(&mod_info.mod_dir(&mods_root))
            .map_err(|e| format!("[{}] {e}", mod_info.name))?;
        if scanned.is_empty() {
            println!("{}: no files to record, skipping", mod_info.name);
            continue;
        }
        runtime
            .block_on(scanned.save(&mod_info.manifest_path(&mods_root)))
            .map_err(|e| format!("[{}] {e}", mod_info.name))?;
        println!(
            "{}: wrote manifest with {} file(s)",
            mod_info.name,
            scanned.len()
        );
    }
    Ok(())
}

fn report_result(result: &ResolutionResult) {
    if result.updates.is_empty() {
        println!("Mods are up to date.");
    } else {
        println!("Updates available:");
        for candidate in &result.updates {
            println!("  {}", candidate.summary());
        }
    }
    if !result.errors.is_empty() {
        println!("Errors occurred while checking for updates:");
        for err in &result.errors {
            println!("  {err}");
        }
    }
}

fn download_all(
    runtime: &Runtime,
    mods_root: &Path,
    updates: &[UpdateCandidate],
    cancel: &Arc<AtomicBool>,
) -> Result<(), String> {
    let downloader = Downloader::new(mods_root.to_path_buf());
    let mut failures = Vec::new();

    for candidate in updates {
        if cancel_requested(&Some(cancel.clone())) {
            println!("Download cancelled.");
            break;
        }
        let bar = download_spinner(&candidate.name, candidate.total_size());
        let applied = runtime.block_on(downloader.apply(
            candidate,
            Some(cancel.clone()),
            &mut |label, downloaded, total, speed| {
                let text = match total {
                    Some(total) if total > 0 => {
                        format!("{label} ({downloaded}/{total} bytes, {speed})")
                    }
                    _ => format!("{label} ({downloaded} bytes, {speed})"),
                };
                bar.set_message(text);
            },
        ));
        bar.finish_and_clear();

        match applied {
            Ok(()) => println!("Updated {}.", candidate.name),
            Err(err) if err == CANCELLED => {
                println!("Download cancelled.");
                break;
            }
            Err(err) => failures.push(format!("[{}] {err}", candidate.name)),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "some downloads failed:\n{}",
            failures.join("\n")
        ))
    }
}

fn checking_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("valid template"),
    );
    pb.set_message(message.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn download_spinner(name: &str, total_bytes: u64) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix} {msg}")
            .expect("valid template"),
    );
    if total_bytes > 0 {
        pb.set_prefix(format!("Downloading {name} ({total_bytes} bytes)"));
    } else {
        pb.set_prefix(format!("Downloading {name}"));
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn check_on_cooldown(mods_root: &Path, cooldown_hours: u64) -> bool {
    if cooldown_hours == 0 {
        return false;
    }
    let stamp = match std::fs::read_to_string(mods_root.join(CHECK_STAMP_FILE)) {
        Ok(stamp) => stamp,
        Err(_) => return false,
    };
    let Ok(last) = stamp.trim().parse::<DateTime<Utc>>() else {
        return false;
    };
    let elapsed = Utc::now().signed_duration_since(last);
    elapsed.num_hours() >= 0 && (elapsed.num_hours() as u64) < cooldown_hours
}

fn write_check_stamp(mods_root: &Path) {
    let path = mods_root.join(CHECK_STAMP_FILE);
    if let Err(err) = std::fs::write(&path, Utc::now().to_rfc3339()) {
        warn!("could not record update check time: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest::MANIFEST_FILE;
    use mods::MOD_CONFIG_FILE;

    #[test]
    fn generate_writes_a_first_reference_manifest() {
        let rt = Runtime::new().unwrap();
        let game = tempfile::tempdir().unwrap();
        let mod_dir = game.path().join("mods").join("TestMod");
        std::fs::create_dir_all(mod_dir.join("system")).unwrap();
        std::fs::write(mod_dir.join(MOD_CONFIG_FILE), b"{\"name\": \"Test Mod\"}").unwrap();
        std::fs::write(mod_dir.join("system").join("mod.dll"), b"content").unwrap();

        cmd_generate(&rt, game.path(), Some("TestMod")).unwrap();

        let saved = rt
            .block_on(Manifest::load(&mod_dir.join(MANIFEST_FILE)))
            .unwrap()
            .unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.get("system/mod.dll").unwrap().size, 7);
        assert!(saved.get(MOD_CONFIG_FILE).is_some());
    }

    #[test]
    fn generate_rejects_unknown_mod_names() {
        let rt = Runtime::new().unwrap();
        let game = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(game.path().join("mods")).unwrap();
        let err = cmd_generate(&rt, game.path(), Some("Missing")).unwrap_err();
        assert!(err.contains("Missing"), "{err}");
    }
}
