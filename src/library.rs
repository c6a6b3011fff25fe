use crate::error::ModError;
use crate::layout::{self, GameLayout};
use crate::metadata::{self, Descriptor, PakSidecar};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DESCRIPTOR_SEARCH_DEPTH: usize = 8;

pub const NO_DESCRIPTOR_DESCRIPTION: &str = "Pak mod without uplugin file";
pub const NO_SIDECAR_DESCRIPTION: &str = "Pak mod without metadata";
const UNKNOWN_VERSION: &str = "Unknown";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModKind {
    FolderMod,
    PackedMod,
}

impl ModKind {
    pub fn label(self) -> &'static str {
        match self {
            ModKind::FolderMod => "Folder",
            ModKind::PackedMod => "Pak",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModMetadata {
    pub author: String,
    pub version: String,
    pub description: String,
    pub category: String,
}

impl ModMetadata {
    fn from_descriptor(descriptor: &Descriptor) -> Self {
        Self {
            author: descriptor.author.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            category: descriptor.category.clone(),
        }
    }

    fn from_sidecar(sidecar: &PakSidecar) -> Self {
        Self {
            author: sidecar
                .author
                .clone()
                .unwrap_or_else(|| metadata::DEFAULT_AUTHOR.to_string()),
            version: sidecar
                .version
                .clone()
                .unwrap_or_else(|| metadata::DEFAULT_VERSION.to_string()),
            description: sidecar
                .description
                .clone()
                .unwrap_or_else(|| metadata::DEFAULT_DESCRIPTION.to_string()),
            category: sidecar
                .category
                .clone()
                .unwrap_or_else(|| metadata::PAK_CATEGORY.to_string()),
        }
    }

    fn bare(description: &str, category: &str) -> Self {
        Self {
            author: metadata::DEFAULT_AUTHOR.to_string(),
            version: UNKNOWN_VERSION.to_string(),
            description: description.to_string(),
            category: category.to_string(),
        }
    }
}

/// One installed mod as inferred from the filesystem right now.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModRecord {
    pub display_name: String,
    pub internal_name: String,
    pub directory: PathBuf,
    pub kind: ModKind,
    pub is_enabled: bool,
    pub metadata: ModMetadata,
    pub packed_search_dirs: Vec<PathBuf>,
    pub disabled_search_dirs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pak_file: Option<PathBuf>,
}

impl ModRecord {
    /// Path handed to the pack builder and shown to users.
    pub fn source_path(&self) -> PathBuf {
        match self.kind {
            ModKind::FolderMod => self.directory.clone(),
            ModKind::PackedMod => self
                .pak_file
                .clone()
                .unwrap_or_else(|| self.directory.join(format!("{}.pak", self.internal_name))),
        }
    }
}

/// Which pak files exist where. The single source of the enabled rule.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PakEvidence {
    /// `*.pak` inside an enabled (`Paks`) directory.
    pub enabled_paks: bool,
    /// `*.pak.disabled` inside an enabled directory.
    pub disabled_paks: bool,
    /// `*.pak` parked inside a `Paks_Disabled` directory.
    pub parked_paks: bool,
}

impl PakEvidence {
    pub fn collect(enabled_dirs: &[PathBuf], disabled_dirs: &[PathBuf]) -> Self {
        Self::gather(enabled_dirs, disabled_dirs, None)
    }

    /// Evidence for the single pak `stem` inside `dir`.
    pub fn for_stem(dir: &Path, stem: &str) -> Self {
        Self::gather(&[dir.to_path_buf()], &[], Some(stem))
    }

    fn gather(enabled_dirs: &[PathBuf], disabled_dirs: &[PathBuf], stem: Option<&str>) -> Self {
        let matches_stem =
            |path: &Path| stem.map_or(true, |stem| metadata::pak_stem(path) == stem);
        let mut evidence = Self::default();
        for dir in enabled_dirs {
            for path in list_files(dir) {
                if !matches_stem(&path) {
                    continue;
                }
                if metadata::is_pak(&path) {
                    evidence.enabled_paks = true;
                } else if metadata::is_disabled_pak(&path) {
                    evidence.disabled_paks = true;
                }
            }
        }
        for dir in disabled_dirs {
            if list_files(dir)
                .iter()
                .any(|path| matches_stem(path) && metadata::is_pak(path))
            {
                evidence.parked_paks = true;
            }
        }
        evidence
    }

    pub fn any(&self) -> bool {
        self.enabled_paks || self.disabled_paks || self.parked_paks
    }

    pub fn is_enabled(&self, disabled_descriptor: bool) -> bool {
        !disabled_descriptor && self.enabled_paks && !self.disabled_paks && !self.parked_paks
    }
}

/// Every mod under the layout's mods root and pak roots.
pub fn scan(layout: &GameLayout) -> Result<Vec<ModRecord>> {
    let mut records = Vec::new();

    if let Some(mods_dir) = &layout.mods_dir {
        debug!(path = %mods_dir.display(), "scanning folder mods");
        for dir in list_dirs(mods_dir)
            .with_context(|| format!("list mods dir {}", mods_dir.display()))?
        {
            if let Some(record) = scan_folder_mod(&dir) {
                records.push(record);
            }
        }
    }

    for pak_root in &layout.pak_roots {
        debug!(path = %pak_root.display(), "scanning pak mods");
        records.extend(scan_pak_root(pak_root));
    }

    info!(count = records.len(), "mod scan finished");
    Ok(records)
}

/// Classifies one directory under the mods root; `None` when it is not a mod.
pub fn scan_folder_mod(dir: &Path) -> Option<ModRecord> {
    let internal_name = dir.file_name()?.to_string_lossy().to_string();
    let (descriptors, disabled_descriptors) = find_descriptors(dir);
    let packed_search_dirs = layout::mod_pak_dirs(dir);
    let disabled_search_dirs = layout::mod_disabled_pak_dirs(dir);
    let evidence = PakEvidence::collect(&packed_search_dirs, &disabled_search_dirs);
    let has_disabled_descriptor = !disabled_descriptors.is_empty();

    let has_descriptor = !descriptors.is_empty() || has_disabled_descriptor;

    let (display_name, metadata, descriptor) = if !has_descriptor {
        if !evidence.any() {
            debug!(path = %dir.display(), "skipping directory without mod content");
            return None;
        }
        (
            internal_name.clone(),
            ModMetadata::bare(NO_DESCRIPTOR_DESCRIPTION, metadata::FOLDER_CATEGORY),
            None,
        )
    } else {
        let descriptor = read_first_descriptor(descriptors.iter().chain(&disabled_descriptors));
        let display_name = descriptor
            .friendly_name
            .clone()
            .unwrap_or_else(|| internal_name.clone());
        (
            display_name,
            ModMetadata::from_descriptor(&descriptor),
            Some(descriptor),
        )
    };

    Some(ModRecord {
        display_name,
        internal_name,
        directory: dir.to_path_buf(),
        kind: ModKind::FolderMod,
        is_enabled: evidence.is_enabled(has_disabled_descriptor),
        metadata,
        packed_search_dirs,
        disabled_search_dirs,
        descriptor,
        pak_file: None,
    })
}

fn read_first_descriptor<'a>(candidates: impl Iterator<Item = &'a PathBuf>) -> Descriptor {
    let mut fallback = None;
    for path in candidates {
        let descriptor = metadata::parse_descriptor(path);
        if descriptor.readable {
            return descriptor;
        }
        fallback.get_or_insert(descriptor);
    }
    fallback.unwrap_or_default()
}

fn find_descriptors(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut enabled = Vec::new();
    let mut disabled = Vec::new();
    for entry in WalkDir::new(dir)
        .max_depth(DESCRIPTOR_SEARCH_DEPTH)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if metadata::is_descriptor(path) {
            enabled.push(path.to_path_buf());
        } else if metadata::is_disabled_descriptor(path) {
            disabled.push(path.to_path_buf());
        }
    }
    (enabled, disabled)
}

fn scan_pak_root(root: &Path) -> Vec<ModRecord> {
    let stems: BTreeSet<String> = list_files(root)
        .iter()
        .filter(|path| metadata::is_pak(path) || metadata::is_disabled_pak(path))
        .map(|path| metadata::pak_stem(path))
        .collect();
    stems
        .into_iter()
        .filter_map(|stem| scan_packed_mod(root, &stem))
        .collect()
}

/// The pak files of one stem, spelled the way they are on disk.
struct PakFiles {
    enabled: Option<PathBuf>,
    disabled: Option<PathBuf>,
}

impl PakFiles {
    fn find(dir: &Path, stem: &str) -> Self {
        let mut files = Self {
            enabled: None,
            disabled: None,
        };
        for path in list_files(dir) {
            if metadata::pak_stem(&path) != stem {
                continue;
            }
            if metadata::is_pak(&path) {
                files.enabled.get_or_insert(path);
            } else if metadata::is_disabled_pak(&path) {
                files.disabled.get_or_insert(path);
            }
        }
        files
    }

    /// Path the pak has, or would have, while enabled.
    fn enabled_name(&self) -> Option<PathBuf> {
        self.enabled
            .clone()
            .or_else(|| self.disabled.as_deref().and_then(metadata::enabled_path))
    }
}

/// Builds the record for `<dir>/<stem>.pak[.disabled]`.
pub fn scan_packed_mod(dir: &Path, stem: &str) -> Option<ModRecord> {
    let files = PakFiles::find(dir, stem);
    let enabled_file = files.enabled_name()?;
    let pak_file = files.enabled.or(files.disabled)?;

    let evidence = PakEvidence::for_stem(dir, stem);
    let (display_name, metadata) = match metadata::parse_pak_sidecar(&metadata::sidecar_path_for(
        &enabled_file,
    )) {
        Some(sidecar) => (
            sidecar.name.clone().unwrap_or_else(|| stem.to_string()),
            ModMetadata::from_sidecar(&sidecar),
        ),
        None => (
            stem.to_string(),
            ModMetadata::bare(NO_SIDECAR_DESCRIPTION, metadata::PAK_CATEGORY),
        ),
    };

    Some(ModRecord {
        display_name,
        internal_name: stem.to_string(),
        directory: dir.to_path_buf(),
        kind: ModKind::PackedMod,
        is_enabled: evidence.is_enabled(false),
        metadata,
        packed_search_dirs: vec![dir.to_path_buf()],
        disabled_search_dirs: Vec::new(),
        descriptor: None,
        pak_file: Some(pak_file),
    })
}

/// Re-reads the record from disk; `None` when the mod vanished.
pub fn rescan(record: &ModRecord) -> Option<ModRecord> {
    match record.kind {
        ModKind::FolderMod => scan_folder_mod(&record.directory),
        ModKind::PackedMod => scan_packed_mod(&record.directory, &record.internal_name),
    }
}

/// Flips the mod's inferred state by renaming files. Not transactional:
/// a failure leaves earlier renames in place.
pub fn toggle(record: &ModRecord) -> Result<ModRecord> {
    if !record.directory.is_dir() {
        return Err(ModError::ModDirectoryMissing(record.directory.clone()).into());
    }
    let current = rescan(record).ok_or_else(|| missing(record))?;

    match (current.kind, current.is_enabled) {
        (ModKind::FolderMod, true) => disable_folder_mod(&current)?,
        (ModKind::FolderMod, false) => enable_folder_mod(&current)?,
        (ModKind::PackedMod, enabled) => toggle_packed_mod(&current, enabled)?,
    }

    let updated = rescan(&current).ok_or_else(|| {
        anyhow::anyhow!("mod {} disappeared while toggling", current.internal_name)
    })?;
    info!(
        name = %updated.internal_name,
        enabled = updated.is_enabled,
        "toggled mod"
    );
    Ok(updated)
}

pub fn set_enabled(record: &ModRecord, enabled: bool) -> Result<ModRecord> {
    let current = rescan(record).ok_or_else(|| missing(record))?;
    if current.is_enabled == enabled {
        return Ok(current);
    }
    toggle(&current)
}

fn missing(record: &ModRecord) -> ModError {
    match record.kind {
        ModKind::FolderMod => ModError::ModDirectoryMissing(record.directory.clone()),
        ModKind::PackedMod => ModError::PakNotFound(record.internal_name.clone()),
    }
}

fn disable_folder_mod(record: &ModRecord) -> Result<()> {
    for dir in &record.packed_search_dirs {
        for path in list_files(dir) {
            if metadata::is_pak(&path) {
                replace_rename(&path, &metadata::disabled_path(&path), "disable pak")?;
            }
        }
    }
    let (descriptors, _) = find_descriptors(&record.directory);
    for path in descriptors {
        replace_rename(&path, &metadata::disabled_path(&path), "disable descriptor")?;
    }
    Ok(())
}

fn enable_folder_mod(record: &ModRecord) -> Result<()> {
    for dir in &record.packed_search_dirs {
        for path in list_files(dir) {
            if let Some(enabled) = metadata::enabled_path(&path).filter(|p| metadata::is_pak(p)) {
                replace_rename(&path, &enabled, "enable pak")?;
            }
        }
    }

    for dir in &record.disabled_search_dirs {
        let target_dir = layout::enabled_twin_dir(dir);
        for path in list_files(dir) {
            let enabled_name = if metadata::is_pak(&path) {
                path.file_name().map(PathBuf::from)
            } else if metadata::is_disabled_pak(&path) {
                metadata::enabled_path(&path).and_then(|p| p.file_name().map(PathBuf::from))
            } else {
                None
            };
            let Some(enabled_name) = enabled_name else {
                continue;
            };
            fs::create_dir_all(&target_dir)
                .with_context(|| format!("create pak dir {}", target_dir.display()))?;
            replace_rename(&path, &target_dir.join(enabled_name), "restore parked pak")?;
        }
    }

    let (_, disabled_descriptors) = find_descriptors(&record.directory);
    for path in disabled_descriptors {
        if let Some(enabled) = metadata::enabled_path(&path) {
            replace_rename(&path, &enabled, "enable descriptor")?;
        }
    }
    Ok(())
}

fn toggle_packed_mod(record: &ModRecord, enabled: bool) -> Result<()> {
    let files = PakFiles::find(&record.directory, &record.internal_name);
    match (enabled, files.enabled, files.disabled) {
        (true, Some(pak), _) => replace_rename(&pak, &metadata::disabled_path(&pak), "disable pak"),
        (false, _, Some(parked)) => {
            let target = metadata::enabled_path(&parked).context("disabled pak name")?;
            replace_rename(&parked, &target, "enable pak")
        }
        _ => Err(ModError::PakNotFound(record.internal_name.clone()).into()),
    }
}

/// Removes the mod from disk. There is no undo.
pub fn delete(record: &ModRecord) -> Result<()> {
    match record.kind {
        ModKind::FolderMod => {
            if !record.directory.is_dir() {
                return Err(ModError::ModDirectoryMissing(record.directory.clone()).into());
            }
            fs::remove_dir_all(&record.directory)
                .with_context(|| format!("delete mod folder {}", record.directory.display()))?;
        }
        ModKind::PackedMod => {
            let files = PakFiles::find(&record.directory, &record.internal_name);
            let sidecar = files
                .enabled_name()
                .map(|pak| metadata::sidecar_path_for(&pak));
            let candidates = [files.disabled, sidecar, files.enabled];
            let mut removed_pak = false;
            for path in candidates.iter().flatten().filter(|path| path.is_file()) {
                fs::remove_file(path)
                    .with_context(|| format!("delete {}", path.display()))?;
                if metadata::is_pak(path) || metadata::is_disabled_pak(path) {
                    removed_pak = true;
                }
            }
            if !removed_pak {
                return Err(ModError::PakNotFound(record.internal_name.clone()).into());
            }
        }
    }
    info!(name = %record.internal_name, "deleted mod");
    Ok(())
}

/// Looks a record up by internal name, then by display name, ignoring case.
pub fn find<'a>(records: &'a [ModRecord], query: &str) -> Option<&'a ModRecord> {
    records
        .iter()
        .find(|record| record.internal_name == query)
        .or_else(|| {
            records
                .iter()
                .find(|record| record.internal_name.eq_ignore_ascii_case(query))
        })
        .or_else(|| {
            records
                .iter()
                .find(|record| record.display_name.eq_ignore_ascii_case(query))
        })
}

fn replace_rename(from: &Path, to: &Path, action: &str) -> Result<()> {
    if to.is_file() {
        fs::remove_file(to).with_context(|| format!("{action}: replace {}", to.display()))?;
    }
    fs::rename(from, to).with_context(|| format!("{action}: {}", from.display()))?;
    debug!(from = %from.display(), to = %to.display(), "{action}");
    Ok(())
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if dir.exists() {
                warn!(path = %dir.display(), error = %err, "could not list directory");
            }
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn game_with_mods() -> (TempDir, GameLayout) {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("BrickRigs").join("Mods")).unwrap();
        let layout = GameLayout::resolve(temp.path());
        (temp, layout)
    }

    fn write_folder_mod(mods_dir: &Path, folder: &str, descriptor: &str) -> PathBuf {
        let dir = mods_dir.join(folder);
        let paks = dir.join("Content").join("Paks").join("WindowsNoEditor");
        fs::create_dir_all(&paks).unwrap();
        fs::write(dir.join(format!("{folder}.uplugin")), descriptor).unwrap();
        fs::write(paks.join(format!("{folder}-WindowsNoEditor.pak")), b"pak").unwrap();
        dir
    }

    fn folder_state(dir: &Path) -> bool {
        scan_folder_mod(dir).unwrap().is_enabled
    }

    #[test]
    fn folder_mod_state_is_stable_across_scans() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        write_folder_mod(&mods_dir, "Tracks", r#"{"FriendlyName": "Tank Tracks"}"#);

        let first = scan(&layout).unwrap();
        let second = scan(&layout).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].display_name, "Tank Tracks");
        assert_eq!(first[0].internal_name, "Tracks");
        assert!(first[0].is_enabled);
        assert_eq!(first[0].packed_search_dirs.len(), 2);
    }

    #[test]
    fn toggle_twice_restores_folder_mod() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        let dir = write_folder_mod(&mods_dir, "Tracks", "{}");
        let record = scan_folder_mod(&dir).unwrap();
        assert!(record.is_enabled);

        let disabled = toggle(&record).unwrap();
        assert!(!disabled.is_enabled);
        assert!(dir.join("Tracks.uplugin.disabled").is_file());
        assert!(!dir.join("Tracks.uplugin").exists());
        assert!(dir
            .join("Content")
            .join("Paks")
            .join("WindowsNoEditor")
            .join("Tracks-WindowsNoEditor.pak.disabled")
            .is_file());

        let enabled = toggle(&disabled).unwrap();
        assert!(enabled.is_enabled);
        assert_eq!(enabled, record);
    }

    #[test]
    fn enabling_moves_parked_paks_back() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        let dir = mods_dir.join("Parked");
        let parked = dir.join("Content").join("Paks_Disabled");
        fs::create_dir_all(&parked).unwrap();
        fs::write(dir.join("Parked.uplugin"), "{}").unwrap();
        fs::write(parked.join("Parked.pak"), b"pak").unwrap();
        assert!(!folder_state(&dir));

        let record = scan_folder_mod(&dir).unwrap();
        let enabled = toggle(&record).unwrap();
        assert!(enabled.is_enabled);
        assert!(dir.join("Content").join("Paks").join("Parked.pak").is_file());
        assert!(!parked.join("Parked.pak").exists());
    }

    #[test]
    fn disabled_descriptor_or_stray_disabled_pak_means_disabled() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        let dir = write_folder_mod(&mods_dir, "Mixed", "{}");
        let paks = dir.join("Content").join("Paks").join("WindowsNoEditor");
        fs::write(paks.join("Extra.pak.disabled"), b"pak").unwrap();
        assert!(!folder_state(&dir));

        let enabled = toggle(&scan_folder_mod(&dir).unwrap()).unwrap();
        assert!(enabled.is_enabled);
        assert!(paks.join("Extra.pak").is_file());
    }

    #[test]
    fn folder_without_descriptor_needs_pak_evidence() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        fs::create_dir_all(mods_dir.join("Empty").join("Docs")).unwrap();
        let paks = mods_dir.join("Loose").join("Paks");
        fs::create_dir_all(&paks).unwrap();
        fs::write(paks.join("Loose.pak"), b"pak").unwrap();

        let records = scan(&layout).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].internal_name, "Loose");
        assert_eq!(records[0].metadata.description, NO_DESCRIPTOR_DESCRIPTION);
        assert!(records[0].descriptor.is_none());
        assert!(records[0].is_enabled);
    }

    #[test]
    fn unreadable_descriptor_still_lists_the_mod() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        write_folder_mod(&mods_dir, "Broken", "{ nope");

        let records = scan(&layout).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].display_name, "Broken");
        assert_eq!(records[0].metadata.description, metadata::UNREADABLE_DESCRIPTION);
    }

    #[test]
    fn lone_pak_without_sidecar_is_one_packed_mod() {
        let temp = TempDir::new().unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        let pak_dir = layout.ensure_pak_dir().unwrap();
        fs::write(pak_dir.join("Planes.pak"), b"pak").unwrap();

        let records = scan(&layout).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.kind, ModKind::PackedMod);
        assert_eq!(record.internal_name, "Planes");
        assert_eq!(record.metadata.description, "Pak mod without metadata");
        assert!(record.is_enabled);
    }

    #[test]
    fn packed_mod_toggles_and_reads_sidecar() {
        let temp = TempDir::new().unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        let pak_dir = layout.ensure_pak_dir().unwrap();
        fs::write(pak_dir.join("Boats.pak"), b"pak").unwrap();
        fs::write(
            pak_dir.join("Boats.pakmeta"),
            r#"{"name": "Fancy Boats", "author": "Sailor", "version": "3.0"}"#,
        )
        .unwrap();

        let records = scan(&layout).unwrap();
        let record = find(&records, "fancy boats").unwrap();
        assert_eq!(record.metadata.author, "Sailor");

        let disabled = toggle(record).unwrap();
        assert!(!disabled.is_enabled);
        assert!(pak_dir.join("Boats.pak.disabled").is_file());
        assert_eq!(scan(&layout).unwrap().len(), 1);

        let enabled = toggle(&disabled).unwrap();
        assert!(enabled.is_enabled);
        assert!(pak_dir.join("Boats.pak").is_file());
    }

    #[test]
    fn delete_removes_pak_twins_and_sidecar() {
        let temp = TempDir::new().unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        let pak_dir = layout.ensure_pak_dir().unwrap();
        fs::write(pak_dir.join("Trains.pak.disabled"), b"pak").unwrap();
        fs::write(pak_dir.join("Trains.pakmeta"), "Author=Conductor").unwrap();

        let records = scan(&layout).unwrap();
        assert_eq!(records[0].metadata.author, "Conductor");
        delete(&records[0]).unwrap();
        assert!(fs::read_dir(&pak_dir).unwrap().next().is_none());
        assert!(delete(&records[0]).is_err());
    }

    #[test]
    fn upper_case_pak_extension_is_listed_and_managed() {
        let temp = TempDir::new().unwrap();
        let mut layout = GameLayout::resolve(temp.path());
        let pak_dir = layout.ensure_pak_dir().unwrap();
        fs::write(pak_dir.join("Planes.PAK"), b"pak").unwrap();
        fs::write(pak_dir.join("Planes.pakmeta"), "Author=Pilot").unwrap();

        let records = scan(&layout).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].internal_name, "Planes");
        assert_eq!(records[0].metadata.author, "Pilot");
        assert!(records[0].is_enabled);

        let disabled = toggle(&records[0]).unwrap();
        assert!(!disabled.is_enabled);
        assert!(pak_dir.join("Planes.PAK.disabled").is_file());
        let enabled = toggle(&disabled).unwrap();
        assert!(enabled.is_enabled);
        assert!(pak_dir.join("Planes.PAK").is_file());

        delete(&enabled).unwrap();
        assert!(fs::read_dir(&pak_dir).unwrap().next().is_none());
    }

    #[test]
    fn toggle_reports_missing_directory() {
        let (_temp, layout) = game_with_mods();
        let mods_dir = layout.mods_dir.clone().unwrap();
        let dir = write_folder_mod(&mods_dir, "Gone", "{}");
        let record = scan_folder_mod(&dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        let err = toggle(&record).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::ModDirectoryMissing(_))
        ));
    }
}
