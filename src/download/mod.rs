use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::manifest::{hash_file, is_safe_relative_path, ManifestEntry, STAGING_DIR};
use crate::sources::{DownloadKind, UpdateCandidate};
use crate::util::{cancel_requested, format_speed};

/// Sentinel error returned when a cancellation flag stops a download.
pub const CANCELLED: &str = "Download cancelled";

/// Per-file progress: label, bytes downloaded, expected total, speed text.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&str, u64, Option<u64>, &str);

/// Fetches an update candidate into the staging tree under
/// `mods/.updates` and applies it to the mod directory.
pub struct Downloader {
    client: Client,
    mods_root: PathBuf,
}

impl Downloader {
    pub fn new(mods_root: PathBuf) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("download: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client, mods_root }
    }

    fn staging_dir(&self, dir_key: &str) -> PathBuf {
        self.mods_root.join(STAGING_DIR).join(dir_key)
    }

    /// Download and apply one candidate. Release assets stay staged for
    /// manual installation; modular candidates are moved into the mod
    /// directory, removed files deleted, and the new reference manifest
    /// persisted. Already-staged files with matching checksums are not
    /// re-fetched, so an interrupted run resumes where it stopped.
    pub async fn apply(
        &self,
        candidate: &UpdateCandidate,
        cancel: Option<Arc<AtomicBool>>,
        progress: ProgressFn<'_>,
    ) -> Result<(), String> {
        match &candidate.kind {
            DownloadKind::Release { tag, url, size } => {
                self.fetch_release(candidate, tag, url, *size, cancel, progress)
                    .await
            }
            DownloadKind::Modular { base_url, .. } => {
                self.fetch_modular(candidate, base_url, cancel, progress)
                    .await
            }
        }
    }

    async fn fetch_release(
        &self,
        candidate: &UpdateCandidate,
        tag: &str,
        url: &str,
        size: u64,
        cancel: Option<Arc<AtomicBool>>,
        progress: ProgressFn<'_>,
    ) -> Result<(), String> {
        let staging = self.staging_dir(&candidate.dir_key);
        let file_name = file_name_from_url(url)
            .unwrap_or_else(|| format!("{}-{tag}.bin", candidate.dir_key));
        let dest = staging.join(&file_name);

        self.download_file(url, &dest, Some(size), &cancel, &file_name, progress)
            .await?;
        info!(
            "download: {} {tag} staged at {} for installation",
            candidate.name,
            dest.display()
        );
        Ok(())
    }

    async fn fetch_modular(
        &self,
        candidate: &UpdateCandidate,
        base_url: &str,
        cancel: Option<Arc<AtomicBool>>,
        progress: ProgressFn<'_>,
    ) -> Result<(), String> {
        let staging = self.staging_dir(&candidate.dir_key);
        let mut errors = Vec::new();

        for diff in candidate.files_to_fetch() {
            if cancel_requested(&cancel) {
                return Err(CANCELLED.into());
            }
            let Some(entry) = diff.reference_entry() else {
                // files_to_fetch only yields Added/Modified, which always
                // carry a reference entry.
                continue;
            };
            if !is_safe_relative_path(&entry.path) {
                warn!("download: rejecting {}", entry.path);
                errors.push(format!("{}: path escapes the mod directory", entry.path));
                continue;
            }
            let dest = staging.join(&entry.path);
            if is_already_staged(&dest, entry) {
                debug!("download: {} already staged, skipping", entry.path);
                continue;
            }

            let url = format!("{base_url}/{}", entry.path);
            let fetched = self
                .download_file(&url, &dest, Some(entry.size), &cancel, &entry.path, &mut *progress)
                .await
                .and_then(|()| verify_staged(&dest, entry));
            if let Err(err) = fetched {
                if err == CANCELLED {
                    return Err(err);
                }
                warn!("download: {} failed: {err}", entry.path);
                errors.push(format!("{}: {err}", entry.path));
            }
        }

        if !errors.is_empty() {
            // Staged files stay put; a repair re-run only fetches the rest.
            return Err(format!(
                "{} file(s) failed to download: {}",
                errors.len(),
                errors.join("; ")
            ));
        }

        self.install_modular(candidate, &staging).await
    }

    /// Move staged files into the mod directory, drop removed paths, and
    /// persist the new reference manifest for the next pass.
    async fn install_modular(
        &self,
        candidate: &UpdateCandidate,
        staging: &Path,
    ) -> Result<(), String> {
        let mod_dir = self.mods_root.join(&candidate.dir_key);
        let DownloadKind::Modular { new_manifest, .. } = &candidate.kind else {
            return Ok(());
        };

        for diff in candidate.files_to_fetch() {
            let staged = staging.join(&diff.path);
            let target = mod_dir.join(&diff.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
            }
            fs::rename(&staged, &target)
                .await
                .map_err(|e| format!("failed to install {}: {e}", diff.path))?;
            debug!("download: installed {}", diff.path);
        }

        for path in candidate.paths_to_remove() {
            if !is_safe_relative_path(path) {
                warn!("download: refusing to remove {path}: path escapes the mod directory");
                continue;
            }
            let target = mod_dir.join(path);
            match fs::remove_file(&target).await {
                Ok(()) => debug!("download: removed {path}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("download: could not remove {path}: {err}"),
            }
        }

        new_manifest
            .save(&mod_dir.join(crate::manifest::MANIFEST_FILE))
            .await?;
        if let Err(err) = fs::remove_dir_all(staging).await {
            debug!("download: staging cleanup skipped: {err}");
        }
        info!("download: {} updated", candidate.name);
        Ok(())
    }

    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        cancel: &Option<Arc<AtomicBool>>,
        label: &str,
        progress: ProgressFn<'_>,
    ) -> Result<(), String> {
        if cancel_requested(cancel) {
            return Err(CANCELLED.into());
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("download failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("download status error: {e}"))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create staging dir: {e}"))?;
        }
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| format!("failed to create staged file: {e}"))?;

        let total = resp.content_length().or(expected_size);
        let mut stream = resp.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel_requested(cancel) {
                let _ = fs::remove_file(dest).await;
                return Err(CANCELLED.into());
            }
            let chunk = chunk.map_err(|e| format!("stream error: {e}"))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("write error: {e}"))?;
            downloaded += chunk.len() as u64;

            let since = last_tick.elapsed().as_secs_f32();
            if since > 0.2 {
                let speed = (downloaded - last_bytes) as f32 / since;
                progress(label, downloaded, total, &format_speed(speed));
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }

        progress(label, downloaded, total, "0 B/s");
        file.flush()
            .await
            .map_err(|e| format!("flush error: {e}"))?;
        if let Some(total) = total
            && downloaded < total
        {
            return Err(format!(
                "download incomplete: received {} of {} bytes",
                downloaded, total
            ));
        }
        Ok(())
    }
}

fn is_already_staged(dest: &Path, entry: &ManifestEntry) -> bool {
    dest.is_file() && hash_file(dest).is_ok_and(|actual| actual == entry.checksum)
}

fn verify_staged(dest: &Path, entry: &ManifestEntry) -> Result<(), String> {
    let actual = hash_file(dest)?;
    if actual != entry.checksum {
        return Err(format!(
            "checksum mismatch: expected {}, got {actual}",
            entry.checksum
        ));
    }
    Ok(())
}

fn file_name_from_url(url: &str) -> Option<String> {
    url.rsplit('/')
        .next()
        .map(|s| s.split(['?', '#']).next().unwrap_or(s))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
