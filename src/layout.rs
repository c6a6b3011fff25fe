use anyhow::{Context, Result};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const PAKS_DIR_NAME: &str = "Paks";
pub const DISABLED_PAKS_DIR_NAME: &str = "Paks_Disabled";

const MODS_ROOT_CANDIDATES: &[&[&str]] = &[&["BrickRigs", "Mods"], &["Mods"]];

const PAK_SCAN_CANDIDATES: &[&[&str]] = &[
    &["BrickRigs", "Content", "Paks", "~mods"],
    &["Content", "Paks", "~mods"],
];

// Older installs dropped paks straight into Content/~mods. The game still
// loads them there, so those dirs count when verifying an install, but new
// paks always go under Paks/~mods where scanning looks.
const PAK_INSTALL_CANDIDATES: &[&[&str]] = &[
    &["BrickRigs", "Content", "Paks", "~mods"],
    &["Content", "Paks", "~mods"],
    &["BrickRigs", "Content", "~mods"],
    &["Content", "~mods"],
];

const MOD_PAK_DIR_CANDIDATES: &[&[&str]] = &[
    &["Paks"],
    &["Content", "Paks"],
    &["Content", "Paks", "WindowsNoEditor"],
];

const MOD_DISABLED_PAK_DIR_CANDIDATES: &[&[&str]] = &[
    &["Paks_Disabled"],
    &["Content", "Paks_Disabled"],
    &["Content", "Paks_Disabled", "WindowsNoEditor"],
];

const PAK_DIR_SEARCH_DEPTH: usize = 8;

/// Returns the first candidate that exists under `root`.
pub fn find_existing(root: &Path, candidates: &[&[&str]]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|parts| join_parts(root, parts))
        .find(|path| path.exists())
}

fn find_all_existing(root: &Path, candidates: &[&[&str]]) -> Vec<PathBuf> {
    candidates
        .iter()
        .map(|parts| join_parts(root, parts))
        .filter(|path| path.is_dir())
        .collect()
}

fn join_parts(root: &Path, parts: &[&str]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Where mods live for one game install, as found on disk right now.
#[derive(Debug, Clone)]
pub struct GameLayout {
    pub game_root: PathBuf,
    pub mods_dir: Option<PathBuf>,
    pub pak_roots: Vec<PathBuf>,
}

impl GameLayout {
    pub fn resolve(game_root: &Path) -> Self {
        let mods_dir = find_existing(game_root, MODS_ROOT_CANDIDATES);
        let pak_roots = find_all_existing(game_root, PAK_SCAN_CANDIDATES);
        debug!(
            game_root = %game_root.display(),
            mods_dir = ?mods_dir,
            pak_roots = pak_roots.len(),
            "resolved game layout"
        );
        Self {
            game_root: game_root.to_path_buf(),
            mods_dir,
            pak_roots,
        }
    }

    /// Folder-mod destination, created when no known layout exists yet.
    pub fn ensure_mods_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = find_existing(&self.game_root, MODS_ROOT_CANDIDATES) {
            self.mods_dir = Some(dir.clone());
            return Ok(dir);
        }

        let preferred = join_parts(&self.game_root, MODS_ROOT_CANDIDATES[0]);
        let dir = match fs::create_dir_all(&preferred) {
            Ok(()) => preferred,
            Err(err) => {
                warn!(
                    path = %preferred.display(),
                    error = %err,
                    "could not create mods dir, falling back to game root"
                );
                let fallback = join_parts(&self.game_root, MODS_ROOT_CANDIDATES[1]);
                fs::create_dir_all(&fallback).context("create mods dir")?;
                fallback
            }
        };
        self.mods_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Packed-mod destination, created under the game's Content dir if missing.
    pub fn ensure_pak_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = find_existing(&self.game_root, PAK_SCAN_CANDIDATES) {
            return Ok(dir);
        }

        let branded = self.game_root.join("BrickRigs").join("Content");
        let content = if branded.is_dir() {
            branded
        } else {
            self.game_root.join("Content")
        };
        let dir = content.join(PAKS_DIR_NAME).join("~mods");
        debug!(path = %dir.display(), "creating pak mods dir");
        fs::create_dir_all(&dir).context("create pak mods dir")?;
        self.pak_roots = find_all_existing(&self.game_root, PAK_SCAN_CANDIDATES);
        Ok(dir)
    }

    /// Every directory an installed pak named `stem` could be in.
    pub fn pak_install_locations(&self) -> Vec<PathBuf> {
        find_all_existing(&self.game_root, PAK_INSTALL_CANDIDATES)
    }
}

/// All `Paks` directories of a folder mod (enabled location).
pub fn mod_pak_dirs(mod_dir: &Path) -> Vec<PathBuf> {
    collect_named_dirs(mod_dir, MOD_PAK_DIR_CANDIDATES, PAKS_DIR_NAME)
}

/// All `Paks_Disabled` directories of a folder mod.
pub fn mod_disabled_pak_dirs(mod_dir: &Path) -> Vec<PathBuf> {
    collect_named_dirs(mod_dir, MOD_DISABLED_PAK_DIR_CANDIDATES, DISABLED_PAKS_DIR_NAME)
}

fn collect_named_dirs(mod_dir: &Path, candidates: &[&[&str]], name: &str) -> Vec<PathBuf> {
    let mut result = find_all_existing(mod_dir, candidates);
    for entry in WalkDir::new(mod_dir)
        .min_depth(1)
        .max_depth(PAK_DIR_SEARCH_DEPTH)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy() != name {
            continue;
        }
        let path = entry.into_path();
        if !result.contains(&path) {
            result.push(path);
        }
    }
    result
}

/// Maps a `Paks_Disabled` directory to the `Paks` directory beside it.
pub fn enabled_twin_dir(disabled_dir: &Path) -> PathBuf {
    disabled_dir
        .components()
        .map(|component| {
            let part = component.as_os_str();
            if part == DISABLED_PAKS_DIR_NAME {
                OsStr::new(PAKS_DIR_NAME)
            } else {
                part
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn find_existing_prefers_earlier_candidates() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Mods")).unwrap();
        assert_eq!(
            find_existing(temp.path(), MODS_ROOT_CANDIDATES),
            Some(temp.path().join("Mods"))
        );

        fs::create_dir_all(temp.path().join("BrickRigs").join("Mods")).unwrap();
        assert_eq!(
            find_existing(temp.path(), MODS_ROOT_CANDIDATES),
            Some(temp.path().join("BrickRigs").join("Mods"))
        );
    }

    #[test]
    fn find_existing_tolerates_missing_root() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        assert_eq!(find_existing(&missing, MODS_ROOT_CANDIDATES), None);
        let layout = GameLayout::resolve(&missing);
        assert!(layout.mods_dir.is_none());
        assert!(layout.pak_roots.is_empty());
    }

    #[test]
    fn ensure_dirs_create_default_layout() {
        let temp = TempDir::new().unwrap();
        let mut layout = GameLayout::resolve(temp.path());

        let mods = layout.ensure_mods_dir().unwrap();
        assert_eq!(mods, temp.path().join("BrickRigs").join("Mods"));
        assert!(mods.is_dir());

        let paks = layout.ensure_pak_dir().unwrap();
        assert_eq!(paks, temp.path().join("Content").join("Paks").join("~mods"));
        assert_eq!(layout.pak_roots, vec![paks]);
    }

    #[test]
    fn ensure_pak_dir_uses_branded_content_when_present() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("BrickRigs").join("Content")).unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        let paks = layout.ensure_pak_dir().unwrap();
        assert_eq!(
            paks,
            temp.path()
                .join("BrickRigs")
                .join("Content")
                .join("Paks")
                .join("~mods")
        );
    }

    #[test]
    fn legacy_pak_dir_is_not_an_install_target() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("BrickRigs").join("Content").join("~mods");
        fs::create_dir_all(&legacy).unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        assert!(layout.pak_roots.is_empty());

        let paks = layout.ensure_pak_dir().unwrap();
        assert_eq!(
            paks,
            temp.path()
                .join("BrickRigs")
                .join("Content")
                .join("Paks")
                .join("~mods")
        );
        assert_eq!(layout.pak_roots, vec![paks]);
        assert!(layout.pak_install_locations().contains(&legacy));
    }

    #[test]
    fn mod_pak_dirs_find_nested_paks_once() {
        let temp = TempDir::new().unwrap();
        let mod_dir = temp.path().join("CoolMod");
        fs::create_dir_all(mod_dir.join("Content").join("Paks").join("WindowsNoEditor")).unwrap();
        fs::create_dir_all(mod_dir.join("Extra").join("Paks")).unwrap();

        let dirs = mod_pak_dirs(&mod_dir);
        assert_eq!(dirs.len(), 3);
        assert!(dirs.contains(&mod_dir.join("Content").join("Paks")));
        assert!(dirs.contains(&mod_dir.join("Extra").join("Paks")));
        assert!(mod_disabled_pak_dirs(&mod_dir).is_empty());
    }

    #[test]
    fn enabled_twin_swaps_only_the_disabled_component() {
        let disabled = Path::new("mods").join("A").join("Content").join("Paks_Disabled");
        assert_eq!(
            enabled_twin_dir(&disabled),
            Path::new("mods").join("A").join("Content").join("Paks")
        );
    }
}
