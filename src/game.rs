use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const GAME_NAME: &str = "Brick Rigs";
const GAME_EXE: &str = "BrickRigs.exe";
const GAME_CONTENT_DIR: &str = "BrickRigs";

const WINDOWS_STEAM_ROOTS: &[&str] = &[
    r"C:\Program Files (x86)\Steam",
    r"C:\Program Files\Steam",
    r"D:\Steam",
    r"E:\Steam",
];

/// Finds an installed copy through Steam's library list and common locations.
pub fn detect_game_root() -> Option<PathBuf> {
    let mut libraries = Vec::new();
    for base in steam_roots() {
        let vdf = base.join("steamapps").join("libraryfolders.vdf");
        if vdf.is_file() {
            match parse_steam_library_paths(&vdf) {
                Ok(paths) => libraries.extend(paths),
                Err(err) => debug!(path = %vdf.display(), error = %err, "skipping steam library list"),
            }
        }
        libraries.push(base);
    }

    libraries
        .into_iter()
        .map(|lib| lib.join("steamapps").join("common").join(GAME_NAME))
        .find(|candidate| looks_like_game_root(candidate))
}

fn steam_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = dirs_home() {
        roots.push(home.join(".local/share/Steam"));
        roots.push(home.join(".steam/steam"));
    }
    if cfg!(windows) {
        roots.extend(WINDOWS_STEAM_ROOTS.iter().map(PathBuf::from));
    }
    roots
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    Ok(parse_library_lines(&raw))
}

fn parse_library_lines(raw: &str) -> Vec<PathBuf> {
    raw.lines()
        .map(str::trim)
        .filter(|line| line.contains("\"path\""))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('"').collect();
            (parts.len() >= 4).then(|| PathBuf::from(parts[3].replace("\\\\", "\\")))
        })
        .collect()
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|base| base.home_dir().to_path_buf())
}

pub fn looks_like_game_root(path: &Path) -> bool {
    path.join(GAME_EXE).is_file() || path.join(GAME_CONTENT_DIR).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn game_root_needs_exe_or_content_dir() {
        let temp = TempDir::new().unwrap();
        assert!(!looks_like_game_root(temp.path()));

        fs::create_dir_all(temp.path().join("BrickRigs")).unwrap();
        assert!(looks_like_game_root(temp.path()));

        let other = TempDir::new().unwrap();
        fs::write(other.path().join("BrickRigs.exe"), b"").unwrap();
        assert!(looks_like_game_root(other.path()));
    }

    #[test]
    fn library_paths_are_read_from_vdf() {
        let vdf = r#""libraryfolders"
{
	"0"
	{
		"path"		"C:\\Program Files (x86)\\Steam"
		"label"		""
	}
	"1"
	{
		"path"		"/mnt/games/SteamLibrary"
	}
}"#;
        let paths = parse_library_lines(vdf);
        assert_eq!(
            paths,
            vec![
                PathBuf::from(r"C:\Program Files (x86)\Steam"),
                PathBuf::from("/mnt/games/SteamLibrary"),
            ]
        );
    }
}
