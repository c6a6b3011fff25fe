use crate::error::ModError;
use crate::importer::{self, InstallReport, StagingGuard};
use crate::layout::GameLayout;
use crate::library::ModRecord;
use crate::metadata::{self, PakSidecar};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, warn};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

pub const MANIFEST_FILE_NAME: &str = "packbundle.json";
pub const MODS_DIR_NAME: &str = "Mods";
pub const PACK_EXTENSION: &str = "brmodpack";
const THUMBNAIL_STEM: &str = "thumbnail";
const PAK_BUNDLE_EXTENSION: &str = "pakbundle";
const BUNDLE_ID_EXTENSION: &str = "pakbundleid";
const FOLDER_INFO_FILE: &str = "mod.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PackEntryKind {
    Folder,
    Pak,
    PakBundle,
    #[serde(other)]
    Unknown,
}

impl PackEntryKind {
    pub fn label(self) -> &'static str {
        match self {
            PackEntryKind::Folder => "Folder",
            PackEntryKind::Pak => "Pak",
            PackEntryKind::PakBundle => "PakBundle",
            PackEntryKind::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ModPackEntry {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: PackEntryKind,
    /// Payload name under `Mods/`; absolute extracted path after [`load`].
    #[serde(default, deserialize_with = "null_as_empty")]
    pub relative_path: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ModPackManifest {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub author: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub created_date: String,
    #[serde(default)]
    pub mods: Vec<ModPackEntry>,
}

impl ModPackManifest {
    /// Accepts RFC 3339 and offset-less ISO timestamps.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        let raw = self.created_date.trim();
        if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Some(parsed);
        }
        let format = time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        );
        PrimitiveDateTime::parse(raw, format)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    }
}

#[derive(Debug, Clone)]
struct PackItem {
    entry: ModPackEntry,
    source: PathBuf,
}

/// Collects mods and pack details, then writes a `.brmodpack` archive.
#[derive(Debug, Clone)]
pub struct ModPackBuilder {
    name: String,
    author: String,
    version: String,
    description: String,
    thumbnail: Option<PathBuf>,
    items: Vec<PackItem>,
}

impl ModPackBuilder {
    pub fn new(name: &str, author: &str, version: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            author: author.to_string(),
            version: version.to_string(),
            description: description.to_string(),
            thumbnail: None,
            items: Vec::new(),
        }
    }

    pub fn thumbnail(mut self, path: &Path) -> Self {
        self.thumbnail = Some(path.to_path_buf());
        self
    }

    pub fn add_path(&mut self, path: &Path) -> Result<&ModPackEntry> {
        if !path.exists() {
            return Err(anyhow::anyhow!("mod path does not exist: {}", path.display()));
        }
        let entry = describe_path(path);
        let taken = self.items.iter().any(|item| {
            item.entry
                .relative_path
                .eq_ignore_ascii_case(&entry.relative_path)
        });
        if taken {
            return Err(anyhow::anyhow!(
                "pack already holds a mod stored as {} ({})",
                entry.relative_path,
                path.display()
            ));
        }
        debug!(
            name = %entry.name,
            kind = entry.kind.label(),
            path = %path.display(),
            "adding mod to pack"
        );
        self.items.push(PackItem {
            entry,
            source: path.to_path_buf(),
        });
        Ok(&self.items[self.items.len() - 1].entry)
    }

    pub fn add_record(&mut self, record: &ModRecord) -> Result<&ModPackEntry> {
        self.add_path(&record.source_path())
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModPackEntry> {
        self.items.iter().map(|item| &item.entry)
    }

    pub fn manifest(&self) -> ModPackManifest {
        let created_date = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        ModPackManifest {
            name: self.name.clone(),
            author: self.author.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            created_date,
            mods: self.entries().cloned().collect(),
        }
    }

    /// Stages every payload under `scratch_root` and zips it to `output`.
    pub fn save(&self, output: &Path, scratch_root: &Path) -> Result<PathBuf> {
        let staging = importer::make_temp_dir(scratch_root, "pack")?;
        let _guard = StagingGuard::new(staging.clone());

        let manifest = self.manifest();
        let json = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        fs::write(staging.join(MANIFEST_FILE_NAME), json).context("write manifest")?;

        let mods_dir = staging.join(MODS_DIR_NAME);
        fs::create_dir_all(&mods_dir).context("create pack mods dir")?;
        for item in &self.items {
            stage_item(item, &mods_dir)?;
        }

        if let Some(thumbnail) = &self.thumbnail {
            if thumbnail.is_file() {
                let file_name = match thumbnail.extension() {
                    Some(ext) => format!("{THUMBNAIL_STEM}.{}", ext.to_string_lossy()),
                    None => THUMBNAIL_STEM.to_string(),
                };
                fs::copy(thumbnail, staging.join(file_name)).context("copy thumbnail")?;
            } else {
                warn!(path = %thumbnail.display(), "thumbnail not found, skipping");
            }
        }

        if output.exists() {
            fs::remove_file(output)
                .with_context(|| format!("replace existing pack {}", output.display()))?;
        }
        if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("create pack output dir")?;
        }
        zip_dir(&staging, output)?;
        info!(
            path = %output.display(),
            mods = self.items.len(),
            "mod pack written"
        );
        Ok(output.to_path_buf())
    }
}

fn describe_path(path: &Path) -> ModPackEntry {
    let kind = entry_kind(path);
    let payload_name = payload_name(path, kind);
    let fallback_name = match kind {
        PackEntryKind::Folder | PackEntryKind::Unknown => payload_name.clone(),
        PackEntryKind::Pak => metadata::pak_stem(path),
        PackEntryKind::PakBundle => file_stem(path),
    };

    let found = match kind {
        PackEntryKind::Folder => folder_info(path),
        PackEntryKind::Pak => {
            let enabled = path.with_file_name(&payload_name);
            metadata::parse_pak_sidecar(&metadata::sidecar_path_for(&enabled))
        }
        PackEntryKind::PakBundle => {
            metadata::parse_pak_sidecar(&path.with_extension(BUNDLE_ID_EXTENSION))
        }
        PackEntryKind::Unknown => None,
    }
    .unwrap_or_default();

    ModPackEntry {
        name: found.name.unwrap_or(fallback_name),
        kind,
        relative_path: payload_name,
        author: found
            .author
            .unwrap_or_else(|| metadata::DEFAULT_AUTHOR.to_string()),
        version: found
            .version
            .unwrap_or_else(|| metadata::DEFAULT_VERSION.to_string()),
    }
}

fn entry_kind(path: &Path) -> PackEntryKind {
    if path.is_dir() {
        return PackEntryKind::Folder;
    }
    if metadata::is_pak(path) || metadata::is_disabled_pak(path) {
        return PackEntryKind::Pak;
    }
    let is_bundle = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PAK_BUNDLE_EXTENSION));
    if is_bundle {
        PackEntryKind::PakBundle
    } else {
        PackEntryKind::Unknown
    }
}

/// Name of the payload inside `Mods/`; disabled paks are packed enabled.
fn payload_name(path: &Path, kind: PackEntryKind) -> String {
    let path = match kind {
        PackEntryKind::Pak => metadata::enabled_path(path).unwrap_or_else(|| path.to_path_buf()),
        _ => path.to_path_buf(),
    };
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn folder_info(dir: &Path) -> Option<PakSidecar> {
    let info = dir.join(FOLDER_INFO_FILE);
    if info.is_file() {
        if let Some(found) = metadata::parse_pak_sidecar(&info) {
            return Some(found);
        }
    }

    let descriptor_path = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| metadata::is_descriptor(path) || metadata::is_disabled_descriptor(path))
        .min()?;
    let descriptor = metadata::parse_descriptor(&descriptor_path);
    descriptor.readable.then(|| PakSidecar {
        name: descriptor.friendly_name.clone(),
        author: Some(descriptor.author.clone()),
        version: Some(descriptor.version.clone()),
        ..PakSidecar::default()
    })
}

fn stage_item(item: &PackItem, mods_dir: &Path) -> Result<()> {
    let dest = mods_dir.join(&item.entry.relative_path);
    if item.source.is_dir() {
        importer::copy_dir(&item.source, &dest)
            .with_context(|| format!("stage folder mod {}", item.entry.name))?;
        return Ok(());
    }

    fs::copy(&item.source, &dest)
        .with_context(|| format!("stage {}", item.source.display()))?;
    match item.entry.kind {
        PackEntryKind::Pak => {
            let enabled = item.source.with_file_name(&item.entry.relative_path);
            let sidecar = metadata::sidecar_path_for(&enabled);
            if sidecar.is_file() {
                fs::copy(&sidecar, metadata::sidecar_path_for(&dest))
                    .context("stage pak sidecar")?;
            }
        }
        PackEntryKind::PakBundle => {
            let bundle_id = item.source.with_extension(BUNDLE_ID_EXTENSION);
            if bundle_id.is_file() {
                fs::copy(&bundle_id, dest.with_extension(BUNDLE_ID_EXTENSION))
                    .context("stage bundle id")?;
            }
        }
        PackEntryKind::Folder | PackEntryKind::Unknown => {}
    }
    Ok(())
}

fn zip_dir(source: &Path, output: &Path) -> Result<()> {
    let file = fs::File::create(output)
        .with_context(|| format!("create pack {}", output.display()))?;
    let mut zip = ZipWriter::new(file);
    add_directory_to_zip(&mut zip, source, "")?;
    zip.finish().context("finish pack archive")?;
    Ok(())
}

fn add_directory_to_zip<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &str,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let full_name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if path.is_dir() {
            zip.add_directory(full_name.as_str(), options)
                .context("add pack directory")?;
            add_directory_to_zip(zip, &path, &full_name)?;
        } else if path.is_file() {
            zip.start_file(full_name.as_str(), options)
                .context("add pack file")?;
            let mut source = fs::File::open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            std::io::copy(&mut source, zip).context("compress pack file")?;
        }
    }
    Ok(())
}

/// An extracted pack. Entry paths point into `root` until [`cleanup`](Self::cleanup).
#[derive(Debug, Clone)]
pub struct LoadedModPack {
    pub manifest: ModPackManifest,
    pub root: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

impl LoadedModPack {
    pub fn cleanup(self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("remove pack scratch dir {}", self.root.display()))?;
        }
        Ok(())
    }
}

/// Extracts `archive` under `scratch_root` and reads its manifest.
pub fn load(archive: &Path, scratch_root: &Path) -> Result<LoadedModPack> {
    let format = importer::sniff_file(archive)?.ok_or_else(|| {
        ModError::InvalidModPack(format!("{} is not an archive", archive.display()))
    })?;
    let root = importer::make_temp_dir(scratch_root, "modpack")?;
    let mut guard = StagingGuard::new(root.clone());
    importer::extract_archive(archive, format, &root)?;
    let loaded = read_extracted(&root)?;
    guard.disarm();
    Ok(loaded)
}

/// Reads the manifest of an already extracted pack rooted at `root`.
pub fn read_extracted(root: &Path) -> Result<LoadedModPack> {
    let manifest_path = root.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
        return Err(ModError::InvalidModPack(format!("missing {MANIFEST_FILE_NAME}")).into());
    }
    let raw = fs::read_to_string(&manifest_path).context("read pack manifest")?;
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
    let mut manifest: ModPackManifest = serde_json::from_str(raw)
        .map_err(|err| ModError::InvalidModPack(format!("unreadable manifest: {err}")))?;

    let mods_dir = root.join(MODS_DIR_NAME);
    if mods_dir.is_dir() {
        for entry in &mut manifest.mods {
            let file_name = Path::new(&entry.relative_path)
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default();
            entry.relative_path = mods_dir.join(file_name).to_string_lossy().to_string();
        }
    } else {
        warn!(path = %root.display(), "mod pack has no Mods directory");
    }

    let thumbnail = find_thumbnail(root);
    info!(
        name = %manifest.name,
        mods = manifest.mods.len(),
        "loaded mod pack"
    );
    Ok(LoadedModPack {
        manifest,
        root: root.to_path_buf(),
        thumbnail,
    })
}

fn find_thumbnail(root: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_stem()
                .is_some_and(|stem| stem.to_string_lossy().eq_ignore_ascii_case(THUMBNAIL_STEM))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Installs every entry of a loaded pack. Stops at the first failure.
pub fn install(
    loaded: &LoadedModPack,
    layout: &mut GameLayout,
    data_dir: &Path,
) -> Result<InstallReport> {
    let mut report = InstallReport::default();
    for entry in &loaded.manifest.mods {
        let source = PathBuf::from(&entry.relative_path);
        if !source.exists() {
            return Err(anyhow::anyhow!(
                "pack entry {} has no payload at {}",
                entry.name,
                source.display()
            ));
        }
        match entry.kind {
            PackEntryKind::Folder => {
                let name = importer::sanitize_folder_name(&entry.name);
                let name = if name.is_empty() { file_stem(&source) } else { name };
                let installed = importer::install_folder(&source, &name, layout, data_dir)?;
                report.push(installed);
            }
            PackEntryKind::Pak => {
                report.push(importer::install_bundled_pak(&source, layout)?);
            }
            PackEntryKind::PakBundle => {
                let nested = importer::install_path(&source, layout, data_dir)
                    .with_context(|| format!("install bundle {}", entry.name))?;
                report.merge(nested);
            }
            PackEntryKind::Unknown => {
                warn!(name = %entry.name, "skipping pack entry of unknown type");
            }
        }
    }
    info!(
        name = %loaded.manifest.name,
        installed = report.len(),
        "mod pack installed"
    );
    Ok(report)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
