use std::path::{Path, PathBuf};

use crate::manifest::STAGING_DIR;

/// Mods live in `mods/` under the game directory, one subdirectory per
/// mod keyed by its directory name.
pub fn mods_root(game_dir: &Path) -> PathBuf {
    game_dir.join("mods")
}

pub fn staging_root(mods_root: &Path) -> PathBuf {
    mods_root.join(STAGING_DIR)
}

/// Drop the staging directory if nothing is left in it. Release assets
/// awaiting manual installation keep it alive.
pub fn clear_staging_if_empty(mods_root: &Path) {
    let staging = staging_root(mods_root);
    if staging.is_dir() {
        let _ = std::fs::remove_dir(staging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_lives_under_the_mods_root() {
        let root = PathBuf::from("/game/mods");
        assert_eq!(staging_root(&root), PathBuf::from("/game/mods/.updates"));
        assert_eq!(mods_root(Path::new("/game")), root);
    }

    #[test]
    fn only_empty_staging_directories_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_root(dir.path());
        std::fs::create_dir_all(&staging).unwrap();
        clear_staging_if_empty(dir.path());
        assert!(!staging.exists());

        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("Mod-1.3.0.7z"), b"staged").unwrap();
        clear_staging_if_empty(dir.path());
        assert!(staging.join("Mod-1.3.0.7z").exists());
    }
}
