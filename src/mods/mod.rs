use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::manifest::MANIFEST_FILE;

/// Per-mod configuration file, stored next to the mod's files.
pub const MOD_CONFIG_FILE: &str = "mod.json";

/// Update-source fields as written by mod authors. `github_repo` +
/// `github_asset` and `update_url` are mutually exclusive ways of
/// publishing updates; a mod may also declare neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModConfig {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub github_repo: Option<String>,
    #[serde(default)]
    pub github_asset: Option<String>,
    #[serde(default)]
    pub update_url: Option<String>,
}

/// An installed mod as seen by the resolver: directory key plus its
/// declared update configuration.
#[derive(Debug, Clone)]
pub struct ModDescriptor {
    /// Directory name under the mods root; unique key.
    pub dir_key: String,
    pub name: String,
    pub version: Option<String>,
    pub github_repo: Option<String>,
    pub github_asset: Option<String>,
    pub update_url: Option<String>,
}

/// The resolved update-source choice for one mod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    GitHub { repo: String, asset: String },
    Modular { base_url: String },
}

impl ModDescriptor {
    pub fn from_config(dir_key: String, config: ModConfig) -> Self {
        Self {
            dir_key,
            name: config.name,
            version: config.version,
            github_repo: config.github_repo,
            github_asset: config.github_asset,
            update_url: config.update_url,
        }
    }

    /// Which update source this mod declares, if any. A GitHub repository
    /// without an asset name is a configuration error, not a silent skip.
    pub fn update_source(&self) -> Result<Option<UpdateSource>, String> {
        if let Some(repo) = non_empty(&self.github_repo) {
            let Some(asset) = non_empty(&self.github_asset) else {
                return Err("GitHubRepo specified, but GitHubAsset is missing.".into());
            };
            return Ok(Some(UpdateSource::GitHub {
                repo: repo.to_owned(),
                asset: asset.to_owned(),
            }));
        }
        if let Some(url) = non_empty(&self.update_url) {
            return Ok(Some(UpdateSource::Modular {
                base_url: url.trim_end_matches('/').to_owned(),
            }));
        }
        Ok(None)
    }

    /// Version string used for release-tag comparison; mods without a
    /// recorded version always look out of date.
    pub fn current_version(&self) -> &str {
        non_empty(&self.version).unwrap_or("")
    }

    pub fn mod_dir(&self, mods_root: &Path) -> PathBuf {
        mods_root.join(&self.dir_key)
    }

    pub fn manifest_path(&self, mods_root: &Path) -> PathBuf {
        self.mod_dir(mods_root).join(MANIFEST_FILE)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Load every mod under the mods root that carries a `mod.json`, in
/// directory-name order. Unreadable or garbled configs are skipped with a
/// warning rather than failing the whole set.
pub async fn load_mod_set(mods_root: &Path) -> Result<Vec<ModDescriptor>, String> {
    let mut dirs = Vec::new();
    let mut read_dir = match fs::read_dir(mods_root).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(format!("failed to read mods dir: {err}")),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| format!("failed to read mods dir entry: {e}"))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| format!("failed to stat mods dir entry: {e}"))?;
        if !file_type.is_dir() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        if key.starts_with('.') {
            continue;
        }
        dirs.push((key, entry.path()));
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut mods = Vec::new();
    for (key, dir) in dirs {
        let config_path = dir.join(MOD_CONFIG_FILE);
        let bytes = match fs::read(&config_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                warn!("mods: skipping {key}: unreadable {MOD_CONFIG_FILE} ({err})");
                continue;
            }
        };
        match serde_json::from_slice::<ModConfig>(&bytes) {
            Ok(config) => mods.push(ModDescriptor::from_config(key, config)),
            Err(err) => {
                warn!("mods: skipping {key}: invalid {MOD_CONFIG_FILE} ({err})");
            }
        }
    }
    Ok(mods)
}
