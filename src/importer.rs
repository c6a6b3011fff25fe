use crate::error::ModError;
use crate::layout::GameLayout;
use crate::library::ModKind;
use crate::metadata;
use crate::modpack;
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use serde::Serialize;
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ARCHIVE_SCAN_DEPTH: usize = 16;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const SEVEN_ZIP_MAGIC: &[u8] = b"7z\xBC\xAF\x27\x1C";

#[derive(Debug, Clone, Serialize)]
pub struct InstalledMod {
    pub name: String,
    pub kind: ModKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub installed: Vec<InstalledMod>,
}

impl InstallReport {
    pub fn push(&mut self, installed: InstalledMod) {
        self.installed.push(installed);
    }

    pub fn merge(&mut self, other: InstallReport) {
        self.installed.extend(other.installed);
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZip,
}

impl ArchiveFormat {
    fn label(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZip => "7z",
        }
    }
}

/// Archive type from the leading bytes, ignoring names and declared types.
pub fn sniff_archive(head: &[u8]) -> Option<ArchiveFormat> {
    if head.starts_with(ZIP_MAGIC) || head.starts_with(ZIP_EMPTY_MAGIC) {
        Some(ArchiveFormat::Zip)
    } else if head.starts_with(SEVEN_ZIP_MAGIC) {
        Some(ArchiveFormat::SevenZip)
    } else {
        None
    }
}

pub fn sniff_file(path: &Path) -> Result<Option<ArchiveFormat>> {
    let mut file =
        fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut head = [0u8; 8];
    let mut filled = 0;
    while filled < head.len() {
        let read = file.read(&mut head[filled..]).context("read file header")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(sniff_archive(&head[..filled]))
}

pub(crate) struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                if self.path.exists() {
                    warn!(path = %self.path.display(), error = %err, "could not remove scratch dir");
                }
            }
        }
    }
}

/// Installs whatever `path` holds: a mod folder, an archive, or a single pak.
pub fn install_path(path: &Path, layout: &mut GameLayout, data_dir: &Path) -> Result<InstallReport> {
    if !path.exists() {
        return Err(anyhow::anyhow!("file not found: {}", path.display()));
    }
    if path.is_dir() {
        info!(path = %path.display(), "installing from directory");
        return install_extracted(path, layout, data_dir);
    }

    match sniff_file(path)? {
        Some(format) => install_archive(path, format, layout, data_dir),
        None if metadata::is_pak(path) => {
            let mut report = InstallReport::default();
            report.push(install_pak_file(path, layout)?);
            Ok(report)
        }
        None => Err(ModError::UnsupportedFile(path.to_path_buf()).into()),
    }
}

fn install_archive(
    path: &Path,
    format: ArchiveFormat,
    layout: &mut GameLayout,
    data_dir: &Path,
) -> Result<InstallReport> {
    info!(path = %path.display(), format = format.label(), "installing archive");
    let temp_dir = make_temp_dir(data_dir, format.label())?;
    let _guard = StagingGuard::new(temp_dir.clone());
    extract_archive(path, format, &temp_dir)?;
    install_extracted(&temp_dir, layout, data_dir)
}

pub(crate) fn extract_archive(path: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    match format {
        ArchiveFormat::Zip => extract_zip(path, dest),
        ArchiveFormat::SevenZip => extract_7z(path, dest),
    }
}

/// Dispatches an unpacked tree: mod pack, folder mods, or a pak bundle.
pub fn install_extracted(root: &Path, layout: &mut GameLayout, data_dir: &Path) -> Result<InstallReport> {
    if root.join(modpack::MANIFEST_FILE_NAME).is_file() {
        info!("archive is a mod pack");
        let loaded = modpack::read_extracted(root)?;
        return modpack::install(&loaded, layout, data_dir);
    }

    let scan = scan_tree(root);
    if !scan.descriptors.is_empty() {
        let mut report = InstallReport::default();
        for descriptor in top_level_descriptors(scan.descriptors) {
            report.push(install_folder_mod(&descriptor, layout, data_dir)?);
        }
        return Ok(report);
    }

    if !scan.paks.is_empty() {
        debug!(count = scan.paks.len(), "no descriptor found, installing pak bundle");
        let mut report = InstallReport::default();
        for pak in &scan.paks {
            report.push(install_bundled_pak(pak, layout)?);
        }
        return Ok(report);
    }

    Err(ModError::UnrecognizedStructure.into())
}

struct TreeScan {
    descriptors: Vec<PathBuf>,
    paks: Vec<PathBuf>,
}

fn scan_tree(root: &Path) -> TreeScan {
    let mut descriptors = Vec::new();
    let mut paks = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(ARCHIVE_SCAN_DEPTH)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored_path(entry.path()))
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if metadata::is_descriptor(path) {
            descriptors.push(path.to_path_buf());
        } else if metadata::is_pak(path) {
            paks.push(path.to_path_buf());
        }
    }
    TreeScan { descriptors, paks }
}

/// Drops descriptors that sit inside another descriptor's folder.
fn top_level_descriptors(mut descriptors: Vec<PathBuf>) -> Vec<PathBuf> {
    descriptors.sort_by_key(|path| path.components().count());
    let mut kept: Vec<PathBuf> = Vec::new();
    for descriptor in descriptors {
        let nested = kept.iter().any(|existing| {
            existing
                .parent()
                .is_some_and(|owner| descriptor.starts_with(owner))
        });
        if nested {
            debug!(path = %descriptor.display(), "nested descriptor belongs to an outer mod");
            continue;
        }
        kept.push(descriptor);
    }
    kept
}

fn install_folder_mod(
    descriptor_path: &Path,
    layout: &mut GameLayout,
    data_dir: &Path,
) -> Result<InstalledMod> {
    let descriptor = metadata::parse_descriptor(descriptor_path);
    let stem = descriptor_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "Mod".to_string());
    let name = descriptor
        .friendly_name
        .as_deref()
        .map(sanitize_folder_name)
        .filter(|name| !name.is_empty())
        .unwrap_or(stem);
    let source = descriptor_path
        .parent()
        .context("descriptor has no parent directory")?;
    install_folder(source, &name, layout, data_dir)
}

/// Copies `source` to `<mods root>/<name>`, replacing any previous copy.
/// A source that overlaps the destination is staged under `data_dir` first.
pub fn install_folder(
    source: &Path,
    name: &str,
    layout: &mut GameLayout,
    data_dir: &Path,
) -> Result<InstalledMod> {
    let mods_dir = layout.ensure_mods_dir()?;
    let dest = mods_dir.join(name);
    let installed = InstalledMod {
        name: name.to_string(),
        kind: ModKind::FolderMod,
        path: dest.clone(),
    };

    let source_real = fs::canonicalize(source)
        .with_context(|| format!("resolve {}", source.display()))?;
    let dest_real = fs::canonicalize(&mods_dir)
        .context("resolve mods dir")?
        .join(name);
    if source_real == dest_real {
        info!(name, path = %dest.display(), "mod is already installed in place");
        return Ok(installed);
    }

    let (source, _staged) =
        if source_real.starts_with(&dest_real) || dest_real.starts_with(&source_real) {
            let scratch = make_temp_dir(data_dir, "folder")?;
            let guard = StagingGuard::new(scratch.clone());
            let copy = scratch.join(name);
            copy_dir(source, &copy).with_context(|| format!("stage mod {name}"))?;
            debug!(path = %copy.display(), "staged overlapping mod source");
            (copy, Some(guard))
        } else {
            (source.to_path_buf(), None)
        };

    if dest.exists() {
        debug!(path = %dest.display(), "replacing existing mod");
        fs::remove_dir_all(&dest)
            .with_context(|| format!("remove existing mod {}", dest.display()))?;
    }
    copy_dir(&source, &dest).with_context(|| format!("install mod {name}"))?;
    info!(name, path = %dest.display(), "installed folder mod");
    Ok(installed)
}

pub(crate) fn install_bundled_pak(pak: &Path, layout: &mut GameLayout) -> Result<InstalledMod> {
    let dest_dir = layout.ensure_pak_dir()?;
    let installed = copy_pak(pak, &dest_dir)?;
    let sidecar = metadata::sidecar_path_for(pak);
    if sidecar.is_file() {
        copy_sidecar(&sidecar, &dest_dir)?;
    }
    info!(path = %installed.path.display(), "installed pak from bundle");
    Ok(installed)
}

/// Installs one standalone pak, generating a sidecar when it has none.
pub fn install_pak_file(pak: &Path, layout: &mut GameLayout) -> Result<InstalledMod> {
    let dest_dir = layout.ensure_pak_dir()?;
    let installed = copy_pak(pak, &dest_dir)?;

    let sidecar = metadata::sidecar_path_for(pak);
    if sidecar.is_file() {
        copy_sidecar(&sidecar, &dest_dir)?;
    } else {
        let written = metadata::write_default_sidecar(pak, &dest_dir)?;
        debug!(path = %written.display(), "generated default sidecar");
    }

    let file_name = pak.file_name().context("pak has no file name")?;
    let verified = layout
        .pak_install_locations()
        .iter()
        .any(|dir| dir.join(file_name).is_file());
    if !verified {
        return Err(ModError::InstallVerification(installed.name.clone()).into());
    }
    info!(path = %installed.path.display(), "installed pak mod");
    Ok(installed)
}

fn copy_pak(pak: &Path, dest_dir: &Path) -> Result<InstalledMod> {
    let file_name = pak.file_name().context("pak has no file name")?;
    let dest = dest_dir.join(file_name);
    if same_file(pak, &dest) {
        debug!(path = %dest.display(), "pak is already in place");
    } else {
        fs::copy(pak, &dest).with_context(|| format!("copy pak to {}", dest.display()))?;
        preserve_mtime(pak, &dest);
    }
    Ok(InstalledMod {
        name: metadata::pak_stem(pak),
        kind: ModKind::PackedMod,
        path: dest,
    })
}

fn copy_sidecar(sidecar: &Path, dest_dir: &Path) -> Result<()> {
    let file_name = sidecar.file_name().context("sidecar has no file name")?;
    let dest = dest_dir.join(file_name);
    if !same_file(sidecar, &dest) {
        fs::copy(sidecar, &dest).with_context(|| format!("copy sidecar to {}", dest.display()))?;
    }
    Ok(())
}

/// Both paths exist and resolve to the same file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Folder names come from descriptors; keep them to one safe path segment.
pub fn sanitize_folder_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
    })
}

pub(crate) fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            warn!(entry = file.name(), "skipping zip entry outside the archive root");
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        std::io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let mtime = FileTime::from_unix_time(mtime, 0);
                let _ = set_file_mtime(&out_path, mtime);
            }
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

pub(crate) fn extract_7z(path: &Path, dest: &Path) -> Result<()> {
    sevenz_rust::decompress_file(path, dest)
        .with_context(|| format!("extract 7z archive {}", path.display()))
}

pub(crate) fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored_path(entry.path()))
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context("create dir")?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create file dir")?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
            preserve_mtime(entry.path(), &target);
        }
    }
    Ok(())
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, 0);
    let _ = set_file_mtime(dest, mtime);
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn make_temp_dir(data_dir: &Path, suffix: &str) -> Result<PathBuf> {
    let temp_dir = temp_path(data_dir, suffix)?;
    fs::create_dir_all(&temp_dir).context("create temp dir")?;
    Ok(temp_dir)
}

/// A fresh, not yet created path under `<data_dir>/tmp`.
pub(crate) fn temp_path(data_dir: &Path, suffix: &str) -> Result<PathBuf> {
    let temp_root = data_dir.join("tmp");
    fs::create_dir_all(&temp_root).context("create temp root")?;

    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(temp_root.join(format!("rigsmith-{nanos}-{counter}-{suffix}")))
}
