use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::manifest::{self, EntryState, Manifest, ManifestDiffEntry, MANIFEST_FILE};
use crate::mods::ModDescriptor;

const GITHUB_API_BASE: &str = "https://api.github.com/repos";
const USER_AGENT: &str = "sadx-mod-updater";

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub browser_download_url: String,
}

/// What one mod needs downloaded. Produced only for out-of-date or
/// divergent mods; an up-to-date mod yields no candidate at all.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub dir_key: String,
    pub name: String,
    pub kind: DownloadKind,
}

#[derive(Debug, Clone)]
pub enum DownloadKind {
    /// One packaged asset from a release.
    Release { tag: String, url: String, size: u64 },
    /// Individual files fetched from the modular base URL. `files` holds
    /// only the non-unchanged diff entries; `new_manifest` is persisted as
    /// the mod's reference manifest once the download is applied.
    Modular {
        base_url: String,
        files: Vec<ManifestDiffEntry>,
        new_manifest: Manifest,
    },
}

impl UpdateCandidate {
    /// Files that must be fetched (added or modified in the reference).
    pub fn files_to_fetch(&self) -> Vec<&ManifestDiffEntry> {
        match &self.kind {
            DownloadKind::Release { .. } => Vec::new(),
            DownloadKind::Modular { files, .. } => files
                .iter()
                .filter(|d| matches!(d.state, EntryState::Added | EntryState::Modified))
                .collect(),
        }
    }

    /// Paths that vanish from the reference and are deleted post-download.
    pub fn paths_to_remove(&self) -> Vec<&str> {
        match &self.kind {
            DownloadKind::Release { .. } => Vec::new(),
            DownloadKind::Modular { files, .. } => files
                .iter()
                .filter(|d| d.state == EntryState::Removed)
                .map(|d| d.path.as_str())
                .collect(),
        }
    }

    pub fn total_size(&self) -> u64 {
        match &self.kind {
            DownloadKind::Release { size, .. } => *size,
            DownloadKind::Modular { .. } => self
                .files_to_fetch()
                .iter()
                .filter_map(|d| d.reference_entry())
                .map(|e| e.size)
                .sum(),
        }
    }

    pub fn summary(&self) -> String {
        match &self.kind {
            DownloadKind::Release { tag, .. } => format!("{} -> {tag}", self.name),
            DownloadKind::Modular { .. } => {
                format!("{} ({} file(s))", self.name, self.files_to_fetch().len())
            }
        }
    }
}

/// HTTP client shared by both update sources. One outstanding request at
/// a time; the resolver serializes mods.
#[derive(Clone)]
pub struct UpdateClient {
    client: Client,
}

impl UpdateClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("sources: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Release-asset source: list the repository's releases and compare
    /// the newest matching one against the mod's recorded version.
    pub async fn check_github(
        &self,
        mod_info: &ModDescriptor,
        repo: &str,
        asset_name: &str,
    ) -> Result<Option<UpdateCandidate>, String> {
        let releases = self.fetch_releases(repo).await?;
        let Some((release, asset)) = find_release_asset(&releases, asset_name) else {
            debug!(
                "sources: no release of {repo} carries an asset named {asset_name}"
            );
            return Ok(None);
        };
        Ok(release_candidate(mod_info, release, asset, false))
    }

    /// Forced variant used by repair: re-download the newest matching
    /// asset without any version comparison.
    pub async fn force_github(
        &self,
        mod_info: &ModDescriptor,
        repo: &str,
        asset_name: &str,
    ) -> Result<Option<UpdateCandidate>, String> {
        let releases = self.fetch_releases(repo).await?;
        let Some((release, asset)) = find_release_asset(&releases, asset_name) else {
            return Err(format!(
                "no release of {repo} carries an asset named {asset_name}"
            ));
        };
        Ok(release_candidate(mod_info, release, asset, true))
    }

    async fn fetch_releases(&self, repo: &str) -> Result<Vec<GitHubRelease>, String> {
        let url = format!("{GITHUB_API_BASE}/{repo}/releases");
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| format!("release query failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("release query returned status {}", resp.status()));
        }
        resp.json::<Vec<GitHubRelease>>()
            .await
            .map_err(|e| format!("release list parse error: {e}"))
    }

    /// Modular-manifest source: fetch the published manifest and diff it
    /// against the mod's stored reference manifest.
    pub async fn check_modular(
        &self,
        mod_info: &ModDescriptor,
        base_url: &str,
        local_reference: &Manifest,
    ) -> Result<Option<UpdateCandidate>, String> {
        let remote = self.fetch_manifest(base_url).await?;
        Ok(modular_candidate(mod_info, base_url, local_reference, remote))
    }

    async fn fetch_manifest(&self, base_url: &str) -> Result<Manifest, String> {
        let url = format!("{base_url}/{MANIFEST_FILE}");
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| format!("manifest fetch failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("manifest fetch returned status {}", resp.status()));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| format!("manifest read error: {e}"))?;
        Manifest::parse(&text).map_err(|e| format!("remote manifest invalid: {e}"))
    }
}

impl Default for UpdateClient {
    fn default() -> Self {
        Self::new()
    }
}

/// First non-draft release whose asset list contains a case-insensitive
/// name match. Releases arrive newest-first from the API.
pub fn find_release_asset<'a>(
    releases: &'a [GitHubRelease],
    asset_name: &str,
) -> Option<(&'a GitHubRelease, &'a GitHubAsset)> {
    releases.iter().filter(|r| !r.draft).find_map(|release| {
        release
            .assets
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(asset_name))
            .map(|asset| (release, asset))
    })
}

/// Tag comparison is exact inequality: any newest tag that differs from
/// the recorded version counts as an update. `forced` skips the
/// comparison entirely.
pub fn release_candidate(
    mod_info: &ModDescriptor,
    release: &GitHubRelease,
    asset: &GitHubAsset,
    forced: bool,
) -> Option<UpdateCandidate> {
    if !forced && release.tag_name == mod_info.current_version() {
        return None;
    }
    Some(UpdateCandidate {
        dir_key: mod_info.dir_key.clone(),
        name: mod_info.name.clone(),
        kind: DownloadKind::Release {
            tag: release.tag_name.clone(),
            url: asset.browser_download_url.clone(),
            size: asset.size,
        },
    })
}

/// Diff the stored reference manifest against a freshly fetched one; any
/// divergence produces a candidate carrying only the divergent entries.
pub fn modular_candidate(
    mod_info: &ModDescriptor,
    base_url: &str,
    local_reference: &Manifest,
    remote: Manifest,
) -> Option<UpdateCandidate> {
    let diff = manifest::diff(local_reference, &remote);
    let files: Vec<ManifestDiffEntry> = diff
        .into_iter()
        .filter(|d| d.state != EntryState::Unchanged)
        .collect();
    if files.is_empty() {
        return None;
    }
    Some(UpdateCandidate {
        dir_key: mod_info.dir_key.clone(),
        name: mod_info.name.clone(),
        kind: DownloadKind::Modular {
            base_url: base_url.to_owned(),
            files,
            new_manifest: remote,
        },
    })
}

/// Repair-mode candidate built from a previously computed diff instead of
/// a remote fetch. The reference side of the diff reconstitutes the
/// manifest to persist once the files are back in place.
pub fn modular_candidate_from_diff(
    mod_info: &ModDescriptor,
    base_url: &str,
    diff: Vec<ManifestDiffEntry>,
) -> Option<UpdateCandidate> {
    let new_manifest = Manifest::from_entries(
        diff.iter()
            .filter_map(|d| d.reference.clone())
            .collect(),
    );
    let files: Vec<ManifestDiffEntry> = diff
        .into_iter()
        .filter(|d| d.state != EntryState::Unchanged)
        .collect();
    if files.is_empty() {
        return None;
    }
    Some(UpdateCandidate {
        dir_key: mod_info.dir_key.clone(),
        name: mod_info.name.clone(),
        kind: DownloadKind::Modular {
            base_url: base_url.to_owned(),
            files,
            new_manifest,
        },
    })
}
