//! Save preservation across uninstall and reinstall.
//!
//! Saves outlive installations: uninstall snapshots the configured save path
//! under `saves/<game_id>/`, reinstall merges the snapshot back. The merge
//! tolerates games that regenerate a subset of save files between reinstall
//! and first launch, and never destroys existing state on a type mismatch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::manifest::GameConfig;

fn snapshot_path(saves_dir: &Path, game_id: &str, save_path: &str) -> PathBuf {
    // Absolute save paths are stored under the same relative location.
    saves_dir
        .join(game_id)
        .join(save_path.trim_start_matches(['/', '\\']))
}

fn resolve_save_source(game_dir: &Path, save_path: &str) -> PathBuf {
    let path = Path::new(save_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        game_dir.join(save_path)
    }
}

/// On uninstall: move the live save path into the snapshot area, displacing
/// any prior snapshot.
pub fn preserve_saves(
    saves_dir: &Path,
    game_id: &str,
    config: &GameConfig,
    game_dir: &Path,
) -> io::Result<()> {
    if !config.save_in_game_folder {
        return Ok(());
    }
    let Some(save_path) = config.save_path.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    let src = resolve_save_source(game_dir, save_path);
    if !src.exists() {
        return Ok(());
    }

    let snapshot = snapshot_path(saves_dir, game_id, save_path);
    if let Some(parent) = snapshot.parent() {
        fs::create_dir_all(parent)?;
    }
    if snapshot.exists() {
        if snapshot.is_dir() {
            fs::remove_dir_all(&snapshot)?;
        } else {
            fs::remove_file(&snapshot)?;
        }
    }
    fs::rename(&src, &snapshot)?;
    tracing::info!(game = game_id, "saves preserved");
    Ok(())
}

/// On install: restore a snapshot, merging directory children into an
/// existing destination directory. A snapshot/destination type mismatch
/// aborts the restore rather than destroying either side.
pub fn restore_saves(
    saves_dir: &Path,
    game_id: &str,
    config: &GameConfig,
    game_dir: &Path,
) -> io::Result<()> {
    if !config.save_in_game_folder {
        return Ok(());
    }
    let Some(save_path) = config.save_path.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    let snapshot = snapshot_path(saves_dir, game_id, save_path);
    if !snapshot.exists() {
        return Ok(());
    }

    let dest = resolve_save_source(game_dir, save_path);

    if snapshot.is_dir() {
        if dest.exists() {
            if !dest.is_dir() {
                tracing::warn!(game = game_id, "save restore skipped: destination is a file");
                return Ok(());
            }
            for child in fs::read_dir(&snapshot)? {
                let child = child?;
                fs::rename(child.path(), dest.join(child.file_name()))?;
            }
            fs::remove_dir_all(&snapshot)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&snapshot, &dest)?;
        }
    } else {
        if dest.exists() && !dest.is_file() {
            tracing::warn!(game = game_id, "save restore skipped: destination is a directory");
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        fs::rename(&snapshot, &dest)?;
    }

    tracing::info!(game = game_id, "saves restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(save_path: &str) -> GameConfig {
        GameConfig {
            name: "Demo".into(),
            id: "demo".into(),
            run: String::new(),
            save_in_game_folder: true,
            save_path: Some(save_path.into()),
            is_steam_game: false,
            get_steam_data: false,
            url: None,
            user: None,
        }
    }

    #[test]
    fn file_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let game_dir = dir.path().join("games/demo");
        fs::create_dir_all(game_dir.join("saves")).unwrap();
        fs::write(game_dir.join("saves/slot1.bin"), b"AABB").unwrap();
        let cfg = config("saves/slot1.bin");

        preserve_saves(&saves, "demo", &cfg, &game_dir).unwrap();
        assert!(!game_dir.join("saves/slot1.bin").exists());
        assert_eq!(
            fs::read(saves.join("demo/saves/slot1.bin")).unwrap(),
            b"AABB"
        );

        // Fresh install places an empty default; restore overwrites it.
        fs::write(game_dir.join("saves/slot1.bin"), b"0000").unwrap();
        restore_saves(&saves, "demo", &cfg, &game_dir).unwrap();
        assert_eq!(fs::read(game_dir.join("saves/slot1.bin")).unwrap(), b"AABB");
        assert!(!saves.join("demo/saves/slot1.bin").exists());
    }

    #[test]
    fn directory_snapshot_merges_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let game_dir = dir.path().join("games/demo");
        let cfg = config("profile");

        fs::create_dir_all(game_dir.join("profile")).unwrap();
        fs::write(game_dir.join("profile/old.sav"), b"old").unwrap();
        preserve_saves(&saves, "demo", &cfg, &game_dir).unwrap();

        // Reinstall regenerated the directory with a different file.
        fs::create_dir_all(game_dir.join("profile")).unwrap();
        fs::write(game_dir.join("profile/fresh.sav"), b"fresh").unwrap();

        restore_saves(&saves, "demo", &cfg, &game_dir).unwrap();
        assert_eq!(fs::read(game_dir.join("profile/old.sav")).unwrap(), b"old");
        assert_eq!(
            fs::read(game_dir.join("profile/fresh.sav")).unwrap(),
            b"fresh"
        );
        assert!(!saves.join("demo/profile").exists());
    }

    #[test]
    fn type_mismatch_aborts_restore() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let game_dir = dir.path().join("games/demo");
        let cfg = config("slot");

        // Snapshot is a directory...
        fs::create_dir_all(saves.join("demo/slot")).unwrap();
        fs::write(saves.join("demo/slot/a.sav"), b"a").unwrap();
        // ...but the installed game put a file at the save path.
        fs::create_dir_all(&game_dir).unwrap();
        fs::write(game_dir.join("slot"), b"file").unwrap();

        restore_saves(&saves, "demo", &cfg, &game_dir).unwrap();
        assert_eq!(fs::read(game_dir.join("slot")).unwrap(), b"file");
        assert!(saves.join("demo/slot/a.sav").exists());
    }

    #[test]
    fn new_snapshot_displaces_previous_one() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        let game_dir = dir.path().join("games/demo");
        let cfg = config("save.bin");

        fs::create_dir_all(saves.join("demo")).unwrap();
        fs::write(saves.join("demo/save.bin"), b"stale").unwrap();

        fs::create_dir_all(&game_dir).unwrap();
        fs::write(game_dir.join("save.bin"), b"current").unwrap();
        preserve_saves(&saves, "demo", &cfg, &game_dir).unwrap();

        assert_eq!(fs::read(saves.join("demo/save.bin")).unwrap(), b"current");
    }

    #[test]
    fn disabled_config_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let game_dir = dir.path().join("games/demo");
        fs::create_dir_all(&game_dir).unwrap();
        fs::write(game_dir.join("save.bin"), b"x").unwrap();

        let mut cfg = config("save.bin");
        cfg.save_in_game_folder = false;
        preserve_saves(&dir.path().join("saves"), "demo", &cfg, &game_dir).unwrap();
        assert!(game_dir.join("save.bin").exists());
    }
}
