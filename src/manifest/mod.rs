use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use walkdir::WalkDir;

/// File name of the reference manifest stored in each mod directory.
pub const MANIFEST_FILE: &str = "mod.manifest";

/// Staging directory for in-flight downloads, excluded from scans.
pub const STAGING_DIR: &str = ".updates";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Relative path within the mod directory, forward slashes.
    pub path: String,
    pub size: u64,
    /// Lowercase SHA-256 hex of the file contents.
    pub checksum: String,
}

/// A mod's file manifest: either the files actually on disk or the
/// reference state published by an update source. Paths are unique keys;
/// entry order is preserved for serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the tab-separated `mod.manifest` format: one
    /// `path<TAB>size<TAB>checksum` record per line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let (path, size, checksum) = match (fields.next(), fields.next(), fields.next()) {
                (Some(path), Some(size), Some(checksum)) if !path.is_empty() => {
                    (path, size, checksum)
                }
                _ => {
                    return Err(format!(
                        "malformed manifest line {}: expected path<TAB>size<TAB>checksum",
                        index + 1
                    ));
                }
            };
            if !is_safe_relative_path(path) {
                return Err(format!(
                    "unsafe file path on manifest line {}: {path}",
                    index + 1
                ));
            }
            let size: u64 = size
                .trim()
                .parse()
                .map_err(|e| format!("malformed file size on manifest line {}: {e}", index + 1))?;
            entries.push(ManifestEntry {
                path: path.to_owned(),
                size,
                checksum: checksum.trim().to_lowercase(),
            });
        }
        Ok(Self { entries })
    }

    /// Render back to the on-disk text format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                entry.path, entry.size, entry.checksum
            ));
        }
        out
    }

    /// Read a mod's reference manifest; `None` if the mod has never
    /// published one.
    pub async fn load(path: &Path) -> Result<Option<Self>, String> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        Self::parse(&text).map(Some)
    }

    pub async fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create manifest dir: {e}"))?;
        }
        fs::write(path, self.to_text())
            .await
            .map_err(|e| format!("failed to write {}: {e}", path.display()))
    }
}

/// How a single path differs between the local state and the reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryState {
    Unchanged,
    /// Present in the reference, absent locally.
    Added,
    /// Present in both with differing checksum or size.
    Modified,
    /// Present locally, absent in the reference.
    Removed,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EntryState::Unchanged => "unchanged",
            EntryState::Added => "added",
            EntryState::Modified => "modified",
            EntryState::Removed => "removed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDiffEntry {
    pub state: EntryState,
    pub path: String,
    pub local: Option<ManifestEntry>,
    pub reference: Option<ManifestEntry>,
}

impl ManifestDiffEntry {
    /// The entry describing the file's desired content, when one exists.
    pub fn reference_entry(&self) -> Option<&ManifestEntry> {
        self.reference.as_ref()
    }
}

/// Classify every path present in either manifest. Pure and total: each
/// path in the union appears exactly once, reference order first, then
/// local-only paths in local order.
pub fn diff(local: &Manifest, reference: &Manifest) -> Vec<ManifestDiffEntry> {
    let local_by_path: HashMap<&str, &ManifestEntry> = local
        .entries()
        .iter()
        .map(|e| (e.path.as_str(), e))
        .collect();

    let mut out = Vec::with_capacity(reference.len() + local.len());
    for entry in reference.entries() {
        let (state, local_entry) = match local_by_path.get(entry.path.as_str()) {
            None => (EntryState::Added, None),
            Some(other) if other.checksum == entry.checksum && other.size == entry.size => {
                (EntryState::Unchanged, Some((*other).clone()))
            }
            Some(other) => (EntryState::Modified, Some((*other).clone())),
        };
        out.push(ManifestDiffEntry {
            state,
            path: entry.path.clone(),
            local: local_entry,
            reference: Some(entry.clone()),
        });
    }
    for entry in local.entries() {
        if reference.get(&entry.path).is_none() {
            out.push(ManifestDiffEntry {
                state: EntryState::Removed,
                path: entry.path.clone(),
                local: Some(entry.clone()),
                reference: None,
            });
        }
    }
    out
}

/// Walk a mod directory and build a fresh manifest of what is actually on
/// disk. The reference manifest itself and the download staging tree are
/// not part of the mod's content.
pub fn scan_directory(dir: &Path) -> Result<Manifest, String> {
    let mut entries = Vec::new();
    for item in WalkDir::new(dir).sort_by_file_name() {
        let item = item.map_err(|e| format!("failed to scan {}: {e}", dir.display()))?;
        if !item.file_type().is_file() {
            continue;
        }
        let rel = item
            .path()
            .strip_prefix(dir)
            .map_err(|e| format!("failed to relativize {}: {e}", item.path().display()))?;
        let rel = normalize_path(rel);
        if rel == MANIFEST_FILE || rel.starts_with(&format!("{STAGING_DIR}/")) {
            continue;
        }
        let size = item
            .metadata()
            .map_err(|e| format!("failed to stat {}: {e}", item.path().display()))?
            .len();
        let checksum = hash_file(item.path())?;
        entries.push(ManifestEntry {
            path: rel,
            size,
            checksum,
        });
    }
    Ok(Manifest::from_entries(entries))
}

/// Streaming SHA-256 of a file, rendered as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String, String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("checksum open error: {e}"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| format!("checksum read error: {e}"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A manifest path must stay inside the mod directory: relative, forward
/// slashes, no parent or root components. Anything else coming out of a
/// remote manifest would write or delete outside the mod tree.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

fn normalize_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
