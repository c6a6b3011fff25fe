use crate::download::{self, CancelToken, ProgressBand, ProgressCallback};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::{
    cmp::Ordering,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const USER_AGENT: &str = "RigSmith";

/// One entry of the remote update feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(alias = "Version")]
    pub version: String,
    #[serde(default, alias = "ReleaseDate")]
    pub release_date: Option<String>,
    #[serde(default, alias = "DownloadUrl")]
    pub download_url: Option<String>,
    #[serde(default, alias = "DirectDownloadUrl")]
    pub direct_download_url: Option<String>,
    #[serde(default, alias = "WhatsNew", deserialize_with = "null_as_default")]
    pub whats_new: Vec<String>,
    #[serde(default, alias = "MinRequiredVersion")]
    pub min_required_version: Option<String>,
    #[serde(default, alias = "IsCriticalUpdate", deserialize_with = "null_as_default")]
    pub is_critical_update: bool,
    #[serde(default, alias = "Sha256", alias = "SHA256")]
    pub sha256: Option<String>,
}

impl VersionInfo {
    /// Direct link when present, else the regular download link.
    pub fn payload_url(&self) -> Option<&str> {
        [&self.direct_download_url, &self.download_url]
            .into_iter()
            .flatten()
            .map(|url| url.trim())
            .find(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate,
    Available(VersionInfo),
}

pub fn parse_feed(text: &str) -> Result<VersionInfo> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    serde_json::from_str(text).context("decode update feed")
}

pub fn check_for_updates(feed_url: &str, current_version: &str) -> Result<UpdateCheck> {
    debug!(url = feed_url, "checking for updates");
    let info = fetch_feed(feed_url)?;
    info!(latest = %info.version, current = current_version, "fetched update feed");
    Ok(evaluate(info, current_version))
}

pub fn evaluate(info: VersionInfo, current_version: &str) -> UpdateCheck {
    if is_newer_version(&info.version, current_version) {
        UpdateCheck::Available(info)
    } else {
        UpdateCheck::UpToDate
    }
}

fn fetch_feed(feed_url: &str) -> Result<VersionInfo> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(10))
        .timeout_write(Duration::from_secs(10))
        .build();
    let response = agent
        .get(feed_url)
        .set("User-Agent", USER_AGENT)
        .call()
        .map_err(|err| download::status_error(err, feed_url))
        .context("fetch update feed")?;
    let body = response.into_string().context("read update feed")?;
    parse_feed(&body)
}

/// True when `latest` is strictly greater. Unparsable input is never newer.
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => compare_versions(&latest, &current) == Ordering::Greater,
        _ => {
            warn!(latest, current, "could not compare versions");
            false
        }
    }
}

fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix('V')
        .or_else(|| raw.strip_prefix('v'))
        .unwrap_or(raw);
    let has_suffix = raw
        .get(raw.len().saturating_sub(2)..)
        .is_some_and(|tail| tail.len() == 2 && tail.eq_ignore_ascii_case("at"));
    let raw = if has_suffix { &raw[..raw.len() - 2] } else { raw };
    if raw.is_empty() {
        return None;
    }
    raw.split('.')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

fn compare_versions(left: &[u64], right: &[u64]) -> Ordering {
    let len = left.len().max(right.len());
    for index in 0..len {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn update_cache_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve cache dir")?;
    let dir = base.cache_dir().join("rigsmith").join("updates");
    fs::create_dir_all(&dir).context("create update cache dir")?;
    Ok(dir)
}

fn payload_file_name(info: &VersionInfo) -> String {
    let version: String = info
        .version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    format!("rigsmith-update-{version}.zip")
}

/// Downloads the update payload into `dir`, reusing a verified earlier copy.
pub fn download_update(
    info: &VersionInfo,
    dir: &Path,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let url = info
        .payload_url()
        .context("update feed has no download url")?;
    let path = dir.join(payload_file_name(info));

    if path.is_file() {
        if let Some(expected) = &info.sha256 {
            if verify_sha256(&path, expected).is_ok() {
                debug!(path = %path.display(), "reusing downloaded update");
                return Ok(path);
            }
        }
    }

    report(progress, 0, "Connecting to server...");
    let response = download::agent()
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .map_err(|err| download::status_error(err, url))
        .context("download update")?;
    let total = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok());

    report(progress, 10, "Starting download...");
    download::write_body(
        response.into_reader(),
        total,
        &path,
        "update",
        ProgressBand::UPDATE_DOWNLOAD,
        progress,
        cancel,
    )?;

    if let Some(expected) = &info.sha256 {
        verify_or_discard(&path, expected)?;
    }
    report(progress, 100, "Download complete");
    info!(version = %info.version, path = %path.display(), "update downloaded");
    Ok(path)
}

fn report(progress: Option<&ProgressCallback>, percent: u8, status: &str) {
    if let Some(callback) = progress {
        callback(download::DownloadProgress {
            percent,
            status: status.to_string(),
        });
    }
}

/// Verifies `path` and removes it when the checksum does not match.
fn verify_or_discard(path: &Path, expected: &str) -> Result<()> {
    let Err(err) = verify_sha256(path, expected) else {
        return Ok(());
    };
    if let Err(remove_err) = fs::remove_file(path) {
        warn!(
            path = %path.display(),
            error = %remove_err,
            "could not remove update with bad checksum"
        );
    }
    Err(err)
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path).context("open update for checksum")?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected.trim().to_lowercase() {
        return Err(anyhow::anyhow!("Checksum mismatch for {}", path.display()));
    }
    Ok(())
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn version_prefix_and_suffix_are_ignored() {
        assert!(is_newer_version("V1.0.19.0", "V1.0.18.0"));
        assert!(is_newer_version("1.1", "V1.0.18.0AT"));
        assert!(!is_newer_version("v1.0.18", "1.0.18.0"));
        assert!(!is_newer_version("1.0.17.9", "1.0.18"));
        assert!(is_newer_version("2", "1.9.9.9"));
    }

    #[test]
    fn unparsable_versions_are_not_newer() {
        assert!(!is_newer_version("latest", "1.0"));
        assert!(!is_newer_version("1.0.x", "0.1"));
        assert!(!is_newer_version("", "0.1"));
        assert!(!is_newer_version("2.0", "beta"));
    }

    #[test]
    fn feed_accepts_both_key_styles() {
        let camel = parse_feed(
            r#"{
                "version": "V1.0.19.0",
                "releaseDate": "2024-05-01T00:00:00",
                "downloadUrl": "https://example.com/page",
                "directDownloadUrl": "https://example.com/update.zip",
                "whatsNew": ["Faster scans"],
                "isCriticalUpdate": true
            }"#,
        )
        .unwrap();
        assert_eq!(camel.version, "V1.0.19.0");
        assert_eq!(camel.payload_url(), Some("https://example.com/update.zip"));
        assert!(camel.is_critical_update);

        let pascal = parse_feed(
            r#"{"Version": "1.0.20", "DownloadUrl": "https://example.com/u.zip",
                "DirectDownloadUrl": "", "WhatsNew": null, "MinRequiredVersion": "1.0"}"#,
        )
        .unwrap();
        assert_eq!(pascal.payload_url(), Some("https://example.com/u.zip"));
        assert!(pascal.whats_new.is_empty());
        assert_eq!(pascal.min_required_version.as_deref(), Some("1.0"));

        assert!(matches!(
            evaluate(pascal.clone(), "1.0.20.0"),
            UpdateCheck::UpToDate
        ));
        assert_eq!(
            evaluate(pascal.clone(), "1.0.19"),
            UpdateCheck::Available(pascal)
        );
    }

    #[test]
    fn checksum_is_verified() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("update.zip");
        fs::write(&path, b"abc").unwrap();
        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        verify_sha256(&path, digest).unwrap();
        verify_sha256(&path, &digest.to_uppercase()).unwrap();
        assert!(verify_sha256(&path, "00").is_err());
    }

    #[test]
    fn mismatched_update_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("update.zip");
        fs::write(&path, b"abc").unwrap();
        assert!(verify_or_discard(&path, "00").is_err());
        assert!(!path.exists());
        assert!(verify_or_discard(&path, "00").is_err());
    }
}
