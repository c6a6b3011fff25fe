use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const DESCRIPTOR_EXTENSION: &str = "uplugin";
pub const PAK_EXTENSION: &str = "pak";
pub const SIDECAR_EXTENSION: &str = "pakmeta";
pub const DISABLED_SUFFIX: &str = ".disabled";

pub const DEFAULT_AUTHOR: &str = "Unknown";
pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_DESCRIPTION: &str = "No description available";
pub const FOLDER_CATEGORY: &str = "Folder Mod";
pub const PAK_CATEGORY: &str = "Pak Mod";
pub const UNREADABLE_DESCRIPTION: &str = "Unable to read mod information";

/// Parsed `.uplugin` descriptor with defaults already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub friendly_name: Option<String>,
    pub author: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub file_version: Option<i64>,
    pub created_by_url: Option<String>,
    pub docs_url: Option<String>,
    pub marketplace_url: Option<String>,
    pub support_url: Option<String>,
    pub can_contain_content: bool,
    pub is_beta_version: bool,
    pub is_experimental_version: bool,
    pub installed: bool,
    /// False when the file could not be read or decoded.
    pub readable: bool,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            friendly_name: None,
            author: DEFAULT_AUTHOR.to_string(),
            version: DEFAULT_VERSION.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            category: FOLDER_CATEGORY.to_string(),
            file_version: None,
            created_by_url: None,
            docs_url: None,
            marketplace_url: None,
            support_url: None,
            can_contain_content: false,
            is_beta_version: false,
            is_experimental_version: false,
            installed: false,
            readable: true,
        }
    }
}

impl Descriptor {
    fn unreadable() -> Self {
        Self {
            description: UNREADABLE_DESCRIPTION.to_string(),
            readable: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDescriptor {
    file_version: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    version: Option<String>,
    version_name: Option<String>,
    friendly_name: Option<String>,
    description: Option<String>,
    category: Option<String>,
    created_by: Option<String>,
    #[serde(rename = "CreatedByURL")]
    created_by_url: Option<String>,
    #[serde(rename = "DocsURL")]
    docs_url: Option<String>,
    #[serde(rename = "MarketplaceURL")]
    marketplace_url: Option<String>,
    #[serde(rename = "SupportURL")]
    support_url: Option<String>,
    can_contain_content: Option<bool>,
    is_beta_version: Option<bool>,
    is_experimental_version: Option<bool>,
    installed: Option<bool>,
}

impl From<RawDescriptor> for Descriptor {
    fn from(raw: RawDescriptor) -> Self {
        let defaults = Descriptor::default();
        Self {
            friendly_name: non_empty(raw.friendly_name),
            author: non_empty(raw.created_by).unwrap_or(defaults.author),
            version: non_empty(raw.version_name)
                .or(non_empty(raw.version))
                .unwrap_or(defaults.version),
            description: non_empty(raw.description).unwrap_or(defaults.description),
            category: non_empty(raw.category).unwrap_or(defaults.category),
            file_version: raw.file_version,
            created_by_url: non_empty(raw.created_by_url),
            docs_url: non_empty(raw.docs_url),
            marketplace_url: non_empty(raw.marketplace_url),
            support_url: non_empty(raw.support_url),
            can_contain_content: raw.can_contain_content.unwrap_or(false),
            is_beta_version: raw.is_beta_version.unwrap_or(false),
            is_experimental_version: raw.is_experimental_version.unwrap_or(false),
            installed: raw.installed.unwrap_or(false),
            readable: true,
        }
    }
}

/// Reads a descriptor, never failing: problems are logged and yield defaults.
pub fn parse_descriptor(path: &Path) -> Descriptor {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read descriptor");
            return Descriptor::unreadable();
        }
    };
    match parse_descriptor_str(&text) {
        Some(descriptor) => descriptor,
        None => {
            warn!(path = %path.display(), "malformed descriptor, using defaults");
            Descriptor::unreadable()
        }
    }
}

pub fn parse_descriptor_str(text: &str) -> Option<Descriptor> {
    serde_json::from_str::<RawDescriptor>(strip_bom(text))
        .ok()
        .map(Descriptor::from)
}

/// Metadata stored next to a standalone pak.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PakSidecar {
    #[serde(
        default,
        alias = "Name",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "Author",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub author: Option<String>,
    #[serde(
        default,
        alias = "Version",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(
        default,
        alias = "Description",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(
        default,
        alias = "Category",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(
        default,
        alias = "Website",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub website: Option<String>,
}

impl PakSidecar {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.author.is_none()
            && self.version.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.website.is_none()
    }
}

/// Reads a sidecar in either the JSON or the legacy `Key=Value` format.
pub fn parse_pak_sidecar(path: &Path) -> Option<PakSidecar> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            if path.exists() {
                warn!(path = %path.display(), error = %err, "could not read sidecar");
            }
            return None;
        }
    };
    let sidecar = parse_pak_sidecar_str(&text);
    if sidecar.is_none() {
        debug!(path = %path.display(), "sidecar carries no usable metadata");
    }
    sidecar
}

pub fn parse_pak_sidecar_str(text: &str) -> Option<PakSidecar> {
    let text = strip_bom(text);
    if let Ok(sidecar) = serde_json::from_str::<PakSidecar>(text) {
        let sidecar = PakSidecar {
            name: non_empty(sidecar.name),
            author: non_empty(sidecar.author),
            version: non_empty(sidecar.version),
            description: non_empty(sidecar.description),
            category: non_empty(sidecar.category),
            website: non_empty(sidecar.website),
        };
        if !sidecar.is_empty() {
            return Some(sidecar);
        }
    }
    parse_legacy_lines(text)
}

fn parse_legacy_lines(text: &str) -> Option<PakSidecar> {
    let mut sidecar = PakSidecar::default();
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Author=") {
            sidecar.author = non_empty(Some(value.trim_end().to_string()));
        } else if let Some(value) = line.strip_prefix("Version=") {
            sidecar.version = non_empty(Some(value.trim_end().to_string()));
        }
    }
    (!sidecar.is_empty()).then_some(sidecar)
}

/// `<dir>/<stem>.pakmeta` for `<dir>/<stem>.pak`.
pub fn sidecar_path_for(pak: &Path) -> PathBuf {
    pak.with_extension(SIDECAR_EXTENSION)
}

/// Writes the sidecar a standalone pak gets when it ships without one.
pub fn write_default_sidecar(pak: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let stem = file_stem_string(pak);
    let sidecar = PakSidecar {
        name: Some(stem.clone()),
        author: Some(DEFAULT_AUTHOR.to_string()),
        version: Some(DEFAULT_VERSION.to_string()),
        description: Some(DEFAULT_DESCRIPTION.to_string()),
        category: Some(PAK_CATEGORY.to_string()),
        website: None,
    };
    let path = dest_dir.join(format!("{stem}.{SIDECAR_EXTENSION}"));
    let json = serde_json::to_string_pretty(&sidecar).context("serialize sidecar")?;
    fs::write(&path, json).with_context(|| format!("write sidecar {}", path.display()))?;
    Ok(path)
}

pub fn is_descriptor(path: &Path) -> bool {
    has_extension(path, DESCRIPTOR_EXTENSION)
}

pub fn is_disabled_descriptor(path: &Path) -> bool {
    disabled_inner(path).is_some_and(|inner| has_extension(&inner, DESCRIPTOR_EXTENSION))
}

pub fn is_pak(path: &Path) -> bool {
    has_extension(path, PAK_EXTENSION)
}

pub fn is_disabled_pak(path: &Path) -> bool {
    disabled_inner(path).is_some_and(|inner| has_extension(&inner, PAK_EXTENSION))
}

/// `Foo.pak` -> `Foo.pak.disabled`.
pub fn disabled_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(DISABLED_SUFFIX);
    PathBuf::from(name)
}

/// `Foo.pak.disabled` -> `Foo.pak`; `None` when the suffix is absent.
pub fn enabled_path(path: &Path) -> Option<PathBuf> {
    disabled_inner(path)
}

fn disabled_inner(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(DISABLED_SUFFIX.trim_start_matches('.')) {
        return None;
    }
    Some(path.with_extension(""))
}

fn has_extension(path: &Path, expected: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(expected))
}

/// File stem with any `.disabled` and `.pak` suffixes removed.
pub fn pak_stem(path: &Path) -> String {
    match disabled_inner(path) {
        Some(inner) => file_stem_string(&inner),
        None => file_stem_string(path),
    }
}

fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}
