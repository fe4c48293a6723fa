use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};

use crate::manifest::{Manifest, ManifestDiffEntry};
use crate::mods::{ModDescriptor, UpdateSource};
use crate::sources::{self, UpdateCandidate, UpdateClient};
use crate::util::cancel_requested;

/// The sole output of a resolution pass: discovered updates in input
/// order plus one error string per failed mod.
#[derive(Debug, Default)]
pub struct ResolutionResult {
    pub updates: Vec<UpdateCandidate>,
    pub errors: Vec<String>,
}

impl ResolutionResult {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.errors.is_empty()
    }
}

/// Walks a mod set and asks each mod's declared update source whether a
/// newer state exists. Mods are processed strictly in input order, one
/// network call outstanding at a time.
pub struct Resolver {
    client: UpdateClient,
    mods_root: PathBuf,
}

impl Resolver {
    pub fn new(mods_root: PathBuf) -> Self {
        Self {
            client: UpdateClient::new(),
            mods_root,
        }
    }

    /// Version-check pass. Cancellation is cooperative: the flag is read
    /// before each mod, and whatever accumulated so far is returned.
    pub async fn resolve(
        &self,
        mods: &[ModDescriptor],
        cancel: &Arc<AtomicBool>,
    ) -> ResolutionResult {
        info!("resolver: checking {} mod(s) for updates", mods.len());
        let mut result = ResolutionResult::default();

        for mod_info in mods {
            if cancel_requested(&Some(cancel.clone())) {
                warn!("resolver: cancelled before {}", mod_info.dir_key);
                break;
            }

            let source = match mod_info.update_source() {
                Ok(Some(source)) => source,
                Ok(None) => {
                    debug!("resolver: {} declares no update source", mod_info.dir_key);
                    continue;
                }
                Err(msg) => {
                    result.errors.push(format!("[{}] {msg}", mod_info.name));
                    continue;
                }
            };

            let checked = match source {
                UpdateSource::GitHub { repo, asset } => {
                    debug!("resolver: {} via releases of {repo}", mod_info.dir_key);
                    self.client.check_github(mod_info, &repo, &asset).await
                }
                UpdateSource::Modular { base_url } => {
                    debug!("resolver: {} via manifest at {base_url}", mod_info.dir_key);
                    match self.local_reference(mod_info).await {
                        Ok(reference) => {
                            self.client
                                .check_modular(mod_info, &base_url, &reference)
                                .await
                        }
                        Err(err) => Err(err),
                    }
                }
            };

            match checked {
                Ok(Some(candidate)) => {
                    info!("resolver: update available: {}", candidate.summary());
                    result.updates.push(candidate);
                }
                Ok(None) => debug!("resolver: {} is up to date", mod_info.dir_key),
                Err(err) => result.errors.push(format!("[{}] {err}", mod_info.name)),
            }
        }

        info!(
            "resolver: pass finished with {} update(s), {} error(s)",
            result.updates.len(),
            result.errors.len()
        );
        result
    }

    /// Repair pass: driven by a previously computed per-mod diff, never by
    /// a fresh version query. An empty input is caller misuse and returns
    /// immediately.
    pub async fn resolve_forced(
        &self,
        items: Vec<(ModDescriptor, Vec<ManifestDiffEntry>)>,
        cancel: &Arc<AtomicBool>,
    ) -> ResolutionResult {
        let mut result = ResolutionResult::default();
        if items.is_empty() {
            warn!("resolver: forced pass requested with no mods");
            return result;
        }
        info!("resolver: forced pass over {} mod(s)", items.len());

        for (mod_info, diff) in items {
            if cancel_requested(&Some(cancel.clone())) {
                warn!("resolver: cancelled before {}", mod_info.dir_key);
                break;
            }

            let source = match mod_info.update_source() {
                Ok(Some(source)) => source,
                Ok(None) => {
                    debug!(
                        "resolver: {} has no update source; cannot repair remotely",
                        mod_info.dir_key
                    );
                    continue;
                }
                Err(msg) => {
                    result.errors.push(format!("[{}] {msg}", mod_info.name));
                    continue;
                }
            };

            match source {
                UpdateSource::GitHub { repo, asset } => {
                    match self.client.force_github(&mod_info, &repo, &asset).await {
                        Ok(Some(candidate)) => result.updates.push(candidate),
                        Ok(None) => {}
                        Err(err) => result.errors.push(format!("[{}] {err}", mod_info.name)),
                    }
                }
                UpdateSource::Modular { base_url } => {
                    if let Some(candidate) =
                        sources::modular_candidate_from_diff(&mod_info, &base_url, diff)
                    {
                        result.updates.push(candidate);
                    } else {
                        debug!("resolver: {} needs no repair", mod_info.dir_key);
                    }
                }
            }
        }

        info!(
            "resolver: forced pass finished with {} download(s), {} error(s)",
            result.updates.len(),
            result.errors.len()
        );
        result
    }

    /// The last-known-good manifest stored in the mod directory; a
    /// modular mod without one cannot be compared against its source.
    async fn local_reference(&self, mod_info: &ModDescriptor) -> Result<Manifest, String> {
        let path = mod_info.manifest_path(&self.mods_root);
        Manifest::load(&path)
            .await?
            .ok_or_else(|| "mod has an UpdateUrl but no local mod.manifest".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EntryState, ManifestEntry, MANIFEST_FILE};
    use std::sync::atomic::Ordering;

    fn plain_mod(key: &str) -> ModDescriptor {
        ModDescriptor {
            dir_key: key.into(),
            name: key.into(),
            version: Some("1.0".into()),
            github_repo: None,
            github_asset: None,
            update_url: None,
        }
    }

    fn entry(path: &str, checksum: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.into(),
            size: 16,
            checksum: checksum.into(),
        }
    }

    fn diff_entry(state: EntryState, path: &str, checksum: &str) -> ManifestDiffEntry {
        ManifestDiffEntry {
            state,
            path: path.into(),
            local: None,
            reference: Some(entry(path, checksum)),
        }
    }

    #[tokio::test]
    async fn pre_raised_cancel_returns_empty_partial_result() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path().to_path_buf());
        let mut broken = plain_mod("broken");
        broken.github_repo = Some("user/broken".into());

        let cancel = Arc::new(AtomicBool::new(true));
        let result = resolver.resolve(&[broken], &cancel).await;
        // Nothing was processed, not even the config validation.
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_mods_are_skipped_silently() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path().to_path_buf());
        let cancel = Arc::new(AtomicBool::new(false));
        let result = resolver
            .resolve(&[plain_mod("a"), plain_mod("b")], &cancel)
            .await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn per_mod_failures_never_abort_the_pass() {
        let root = tempfile::tempdir().unwrap();

        // Config error: repo without asset. No network call is attempted.
        let mut bad_config = plain_mod("BadConfig");
        bad_config.github_repo = Some("user/bad".into());

        // Modular mod without a stored reference manifest.
        let mut no_manifest = plain_mod("NoManifest");
        no_manifest.update_url = Some("http://127.0.0.1:9/NoManifest".into());

        // Modular mod whose remote host refuses connections.
        let mut unreachable = plain_mod("Unreachable");
        unreachable.update_url = Some("http://127.0.0.1:9/Unreachable".into());
        let dir = root.path().join("Unreachable");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), "a.dll\t16\th1\n").unwrap();

        let resolver = Resolver::new(root.path().to_path_buf());
        let cancel = Arc::new(AtomicBool::new(false));
        let result = resolver
            .resolve(
                &[bad_config, plain_mod("fine"), no_manifest, unreachable],
                &cancel,
            )
            .await;

        assert!(result.updates.is_empty());
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors[0].starts_with("[BadConfig]"));
        assert!(result.errors[1].starts_with("[NoManifest]"));
        assert!(result.errors[2].starts_with("[Unreachable]"));
        assert!(!cancel.load(Ordering::SeqCst));
    }

    /// Minimal HTTP responder for manifest fetches; serves the same body
    /// for every request until the listener is dropped.
    async fn serve_text(listener: tokio::net::TcpListener, body: &'static str) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn resolve_mixes_candidates_and_errors_in_one_pass() {
        let root = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_text(listener, "a.dll\t16\th2\n"));

        // Two modular mods whose stored reference diverges from the
        // published manifest, with a broken config between them.
        let mut outdated_a = plain_mod("AMod");
        outdated_a.update_url = Some(format!("{base}/AMod"));
        let mut outdated_z = plain_mod("ZMod");
        outdated_z.update_url = Some(format!("{base}/ZMod"));
        for key in ["AMod", "ZMod"] {
            let dir = root.path().join(key);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(MANIFEST_FILE), "a.dll\t16\th1\n").unwrap();
        }
        let mut bad_config = plain_mod("BadConfig");
        bad_config.github_repo = Some("user/bad".into());

        let resolver = Resolver::new(root.path().to_path_buf());
        let cancel = Arc::new(AtomicBool::new(false));
        let result = resolver
            .resolve(&[outdated_a, bad_config, outdated_z], &cancel)
            .await;

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("[BadConfig]"));
        let keys: Vec<&str> = result.updates.iter().map(|c| c.dir_key.as_str()).collect();
        assert_eq!(keys, vec!["AMod", "ZMod"]);
        let fetch: Vec<&str> = result.updates[0]
            .files_to_fetch()
            .iter()
            .map(|d| d.path.as_str())
            .collect();
        assert_eq!(fetch, vec!["a.dll"]);
    }

    #[tokio::test]
    async fn forced_pass_with_no_items_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path().to_path_buf());
        let cancel = Arc::new(AtomicBool::new(false));
        let result = resolver.resolve_forced(Vec::new(), &cancel).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn forced_pass_isolates_failures_and_builds_offline_candidates() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(root.path().to_path_buf());
        let cancel = Arc::new(AtomicBool::new(false));

        let mut needs_repair = plain_mod("NeedsRepair");
        needs_repair.update_url = Some("http://mods.example/NeedsRepair".into());
        let repair_diff = vec![
            diff_entry(EntryState::Unchanged, "ok.dll", "h1"),
            diff_entry(EntryState::Modified, "bad.dll", "h2"),
        ];

        let mut bad_config = plain_mod("BadConfig");
        bad_config.github_repo = Some("user/bad".into());

        let mut intact = plain_mod("Intact");
        intact.update_url = Some("http://mods.example/Intact".into());
        let intact_diff = vec![diff_entry(EntryState::Unchanged, "ok.dll", "h1")];

        let result = resolver
            .resolve_forced(
                vec![
                    (needs_repair, repair_diff),
                    (bad_config, Vec::new()),
                    (intact, intact_diff),
                ],
                &cancel,
            )
            .await;

        assert_eq!(result.updates.len(), 1);
        assert_eq!(result.updates[0].dir_key, "NeedsRepair");
        let fetch: Vec<&str> = result.updates[0]
            .files_to_fetch()
            .iter()
            .map(|d| d.path.as_str())
            .collect();
        assert_eq!(fetch, vec!["bad.dll"]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("[BadConfig]"));
    }
}
