use crate::error::ModError;
use crate::importer::{self, ArchiveFormat, InstallReport, StagingGuard};
use crate::layout::GameLayout;
use crate::metadata;
use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";
const CHUNK_SIZE: usize = 8192;
const SNIFF_LEN: usize = 512;
const FALLBACK_FILE_NAME: &str = "mod.pak";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Shared flag checked between download chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(ModError::Canceled.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub percent: u8,
    pub status: String,
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

fn report(progress: Option<&ProgressCallback>, percent: u64, status: impl Into<String>) {
    if let Some(callback) = progress {
        callback(DownloadProgress {
            percent: percent.min(100) as u8,
            status: status.into(),
        });
    }
}

/// Slice of the 0..=100 progress range a body download reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBand {
    pub start: u64,
    pub span: u64,
}

impl ProgressBand {
    pub const MOD_DOWNLOAD: ProgressBand = ProgressBand { start: 20, span: 60 };
    pub const UPDATE_DOWNLOAD: ProgressBand = ProgressBand { start: 10, span: 90 };
    const UNKNOWN_SIZE: u64 = 50;
}

/// What a finished download turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Archive(ArchiveFormat),
    Pak,
}

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub file_name: String,
    pub content_type: Option<String>,
}

struct UrlParts<'a> {
    scheme: &'a str,
    host: &'a str,
    path: &'a str,
}

fn split_url(url: &str) -> Option<UrlParts<'_>> {
    let (scheme, rest) = url.split_once("://")?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (host, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, ""),
    };
    Some(UrlParts { scheme, host, path })
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn drive_file_id(url: &str) -> Option<&str> {
    let start = url.find("file/d/")? + "file/d/".len();
    let rest = &url[start..];
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

/// Rewrites share links from common hosts into direct-download links.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("dropbox.com") || url.contains("dropboxusercontent.com") {
        if url.contains("dl.dropboxusercontent.com") {
            if let Some(parts) = split_url(url) {
                return format!("{}://{}{}?raw=1", parts.scheme, parts.host, parts.path);
            }
        } else if url.contains("dropbox.com/s/") {
            let direct = url.replace("www.dropbox.com/s/", "dl.dropboxusercontent.com/s/");
            return format!("{}?raw=1", strip_query(&direct));
        } else if let Some(parts) = split_url(url) {
            let path = parts.path.replace("/view/", "/raw/");
            return format!("https://dl.dropboxusercontent.com{path}?raw=1");
        }
        return url.to_string();
    }

    if url.contains("googleapis.com/drive/v3/files/") && url.contains("alt=media") {
        return url.to_string();
    }

    if url.contains("drive.google.com") {
        if let Some(id) = drive_file_id(url) {
            return format!("https://drive.google.com/uc?export=download&id={id}");
        }
        if url.contains("id=") && !url.contains("export=download") {
            return format!("{url}&export=download");
        }
    }

    url.to_string()
}

/// Alternate link to try once after a 403, when the host has one.
pub fn restricted_fallback_url(url: &str) -> Option<String> {
    if url.contains("dropbox.com") {
        let alt = url
            .replace("www.dropbox.com", "dl.dropboxusercontent.com")
            .replace("?dl=0", "")
            .replace("?dl=1", "");
        return Some(format!("{alt}?raw=1"));
    }
    if url.contains("drive.google.com") {
        let id = drive_file_id(url)?;
        return Some(format!(
            "https://drive.google.com/uc?export=download&confirm=t&id={id}"
        ));
    }
    None
}

/// Decides what a download holds. Sniffed bytes win over the declared type.
pub fn classify_download(content_type: Option<&str>, head: &[u8]) -> Result<DownloadKind> {
    if let Some(format) = importer::sniff_archive(head) {
        return Ok(DownloadKind::Archive(format));
    }

    let declared_page = content_type.is_some_and(|value| {
        let value = value.to_ascii_lowercase();
        value.contains("text/html") || value.contains("text/plain")
    });
    if declared_page || looks_like_html(head) {
        let text = String::from_utf8_lossy(head);
        let dropbox = text.contains("Dropbox") && text.contains("download");
        return Err(ModError::WebPage { dropbox }.into());
    }

    Ok(DownloadKind::Pak)
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start().to_ascii_lowercase();
    text.starts_with("<!doctype html") || text.starts_with("<html")
}

/// File name from a `Content-Disposition` value or the URL path, else `mod.pak`.
pub fn download_file_name(content_disposition: Option<&str>, url: &str) -> String {
    let from_header = content_disposition.and_then(disposition_file_name);
    let from_url = || {
        let path = split_url(url).map(|parts| parts.path).unwrap_or("");
        path.rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    };
    from_header
        .or_else(from_url)
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

fn disposition_file_name(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let part = part.trim();
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim().trim_matches(|c| c == '"' || c == '\'');
        if key == "filename*" {
            let encoded = raw.rsplit("''").next().unwrap_or(raw);
            if !encoded.is_empty() {
                return Some(percent_decode(encoded));
            }
        } else if key == "filename" && !raw.is_empty() {
            plain = Some(raw.to_string());
        }
    }
    plain
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).ok();
            if let Some(byte) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                out.push(byte);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn sanitize_file_name(name: &str) -> String {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Removes a partially written file unless the download completed.
struct PartialFile<'a> {
    path: &'a Path,
    keep: bool,
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            if let Err(err) = fs::remove_file(self.path) {
                warn!(path = %self.path.display(), error = %err, "could not remove partial download");
            }
        }
    }
}

/// Streams `reader` into `dest` in fixed chunks, reporting progress and
/// honoring `cancel` between chunks. On any failure `dest` is removed.
pub fn write_body<R: Read>(
    mut reader: R,
    total: Option<u64>,
    dest: &Path,
    label: &str,
    band: ProgressBand,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut guard = PartialFile {
        path: dest,
        keep: false,
    };
    let mut file =
        File::create(dest).with_context(|| format!("create download file {}", dest.display()))?;
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        cancel.check()?;
        let read = reader.read(&mut buffer).context("read download body")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .context("write download body")?;
        written += read as u64;

        let downloaded_mb = written as f64 / BYTES_PER_MB;
        match total.filter(|total| *total > 0) {
            Some(total) => {
                let pct = (written * 100 / total).min(100);
                let total_mb = total as f64 / BYTES_PER_MB;
                report(
                    progress,
                    band.start + pct * band.span / 100,
                    format!("Downloading {label}: {downloaded_mb:.1} MB / {total_mb:.1} MB ({pct}%)"),
                );
            }
            None => report(
                progress,
                ProgressBand::UNKNOWN_SIZE,
                format!("Downloading {label}: {downloaded_mb:.1} MB"),
            ),
        }
    }
    file.flush().context("flush download file")?;
    cancel.check()?;
    guard.keep = true;
    Ok(written)
}

pub(crate) fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(15))
        .timeout_read(Duration::from_secs(60))
        .timeout_write(Duration::from_secs(60))
        .build()
}

fn fetch(agent: &ureq::Agent, url: &str) -> std::result::Result<ureq::Response, ureq::Error> {
    agent
        .get(url)
        .set("User-Agent", BROWSER_USER_AGENT)
        .set("Accept", BROWSER_ACCEPT)
        .set("Accept-Language", BROWSER_ACCEPT_LANGUAGE)
        .call()
}

fn open(url: &str, progress: Option<&ProgressCallback>) -> Result<ureq::Response> {
    let agent = agent();
    match fetch(&agent, url) {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(403, _)) => {
            let Some(alt) = restricted_fallback_url(url) else {
                return Err(anyhow::anyhow!("server returned 403 Forbidden for {url}"));
            };
            debug!(url = %alt, "got 403, retrying with alternate link");
            report(progress, 15, "Access denied, trying alternative approach...");
            fetch(&agent, &alt).map_err(|err| status_error(err, &alt))
        }
        Err(err) => Err(status_error(err, url)),
    }
}

pub(crate) fn status_error(err: ureq::Error, url: &str) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            anyhow::anyhow!("server returned error {code} {}", response.status_text())
        }
        other => anyhow::Error::new(other).context(format!("request {url}")),
    }
}

/// Downloads `url` (already normalized) into `dest`.
pub fn download_to(
    url: &str,
    dest: &Path,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> Result<Downloaded> {
    report(progress, 10, "Connecting to server...");
    cancel.check()?;
    let response = open(url, progress)?;
    cancel.check()?;

    let file_name = download_file_name(response.header("Content-Disposition"), response.get_url());
    let content_type = response.header("Content-Type").map(str::to_string);
    let total = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok());
    debug!(
        file = %file_name,
        content_type = ?content_type,
        size = ?total,
        "download started"
    );

    report(progress, 20, format!("Downloading {file_name}..."));
    let bytes = write_body(
        response.into_reader(),
        total,
        dest,
        &file_name,
        ProgressBand::MOD_DOWNLOAD,
        progress,
        cancel,
    )?;
    info!(file = %file_name, bytes, "download finished");
    Ok(Downloaded {
        file_name,
        content_type,
    })
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).context("open downloaded file")?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    Read::by_ref(&mut file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .context("read downloaded file")?;
    Ok(head)
}

/// Downloads a mod from `url` and installs it. Scratch files never outlive the call.
pub fn install_from_url(
    url: &str,
    layout: &mut GameLayout,
    data_dir: &Path,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> Result<InstallReport> {
    report(progress, 0, "Preparing download...");
    let direct = normalize_url(url);
    if direct != url.trim() {
        debug!(url = %direct, "using direct download link");
    }

    let staging = importer::make_temp_dir(data_dir, "download")?;
    let _guard = StagingGuard::new(staging.clone());
    let part = staging.join("download.part");
    let downloaded = download_to(&direct, &part, progress, cancel)?;
    let result = install_downloaded(&part, &downloaded, layout, data_dir, progress, cancel)?;
    report(progress, 100, "Installation complete");
    Ok(result)
}

/// Classifies a finished download by its bytes and installs it. A pak is
/// renamed beside `part` first, so `part` should live in a scratch dir.
pub fn install_downloaded(
    part: &Path,
    downloaded: &Downloaded,
    layout: &mut GameLayout,
    data_dir: &Path,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> Result<InstallReport> {
    report(progress, 85, "Verifying download...");
    let head = read_head(part)?;
    let kind = classify_download(downloaded.content_type.as_deref(), &head)?;
    debug!(kind = ?kind, "classified download");
    cancel.check()?;

    match kind {
        DownloadKind::Archive(_) => {
            report(progress, 90, format!("Installing {}...", downloaded.file_name));
            importer::install_path(part, layout, data_dir)
        }
        DownloadKind::Pak => {
            report(progress, 90, "Installing Pak mod...");
            let dir = part.parent().context("download has no parent dir")?;
            let pak = dir.join(pak_file_name(&downloaded.file_name));
            fs::rename(part, &pak).context("name downloaded pak")?;
            let mut installed = InstallReport::default();
            installed.push(importer::install_pak_file(&pak, layout)?);
            Ok(installed)
        }
    }
}

fn pak_file_name(file_name: &str) -> String {
    if metadata::is_pak(Path::new(file_name)) {
        return file_name.to_string();
    }
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "mod".to_string());
    format!("{stem}.{}", metadata::PAK_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn dropbox_links_become_raw_links() {
        assert_eq!(
            normalize_url("https://www.dropbox.com/s/abc123/Tracks.zip?dl=0"),
            "https://dl.dropboxusercontent.com/s/abc123/Tracks.zip?raw=1"
        );
        assert_eq!(
            normalize_url("https://dl.dropboxusercontent.com/s/abc123/Tracks.zip?dl=1"),
            "https://dl.dropboxusercontent.com/s/abc123/Tracks.zip?raw=1"
        );
        assert_eq!(
            normalize_url("https://www.dropbox.com/scl/fi/xyz/view/Tracks.zip?rlkey=1"),
            "https://dl.dropboxusercontent.com/scl/fi/xyz/raw/Tracks.zip?raw=1"
        );
    }

    #[test]
    fn drive_links_become_export_links() {
        assert_eq!(
            normalize_url("https://drive.google.com/file/d/FILEID/view?usp=sharing"),
            "https://drive.google.com/uc?export=download&id=FILEID"
        );
        assert_eq!(
            normalize_url("https://drive.google.com/open?id=FILEID"),
            "https://drive.google.com/open?id=FILEID&export=download"
        );
        let api = "https://www.googleapis.com/drive/v3/files/FILEID?alt=media&key=K";
        assert_eq!(normalize_url(api), api);
        assert_eq!(
            normalize_url("https://example.com/mods/Tracks.zip"),
            "https://example.com/mods/Tracks.zip"
        );
    }

    #[test]
    fn fallback_only_for_known_hosts() {
        assert_eq!(
            restricted_fallback_url("https://www.dropbox.com/s/abc/Tracks.zip?dl=0").as_deref(),
            Some("https://dl.dropboxusercontent.com/s/abc/Tracks.zip?raw=1")
        );
        assert_eq!(
            restricted_fallback_url("https://drive.google.com/file/d/FILEID/view").as_deref(),
            Some("https://drive.google.com/uc?export=download&confirm=t&id=FILEID")
        );
        assert_eq!(restricted_fallback_url("https://drive.google.com/uc?id=X"), None);
        assert_eq!(restricted_fallback_url("https://example.com/a.pak"), None);
    }

    #[test]
    fn archive_bytes_win_over_html_content_type() {
        let kind = classify_download(Some("text/html; charset=utf-8"), b"PK\x03\x04rest").unwrap();
        assert_eq!(kind, DownloadKind::Archive(ArchiveFormat::Zip));
        let kind = classify_download(None, b"7z\xBC\xAF\x27\x1Cdata").unwrap();
        assert_eq!(kind, DownloadKind::Archive(ArchiveFormat::SevenZip));
    }

    #[test]
    fn web_pages_are_rejected() {
        let err = classify_download(Some("text/html"), b"<html>Dropbox - click download</html>")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::WebPage { dropbox: true })
        ));

        let err = classify_download(Some("application/octet-stream"), b"\n<!DOCTYPE html><p>")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::WebPage { dropbox: false })
        ));

        let kind = classify_download(Some("application/octet-stream"), b"\xE1\x12\x6F\x5A").unwrap();
        assert_eq!(kind, DownloadKind::Pak);
    }

    #[test]
    fn file_name_prefers_content_disposition() {
        assert_eq!(
            download_file_name(Some("attachment; filename=\"Boats.pak\""), "https://x.test/dl"),
            "Boats.pak"
        );
        assert_eq!(
            download_file_name(
                Some("attachment; filename=\"fallback.zip\"; filename*=UTF-8''Big%20Tanks.zip"),
                "https://x.test/dl"
            ),
            "Big Tanks.zip"
        );
        assert_eq!(
            download_file_name(None, "https://x.test/files/Cars.zip?raw=1"),
            "Cars.zip"
        );
        assert_eq!(download_file_name(None, "https://x.test/"), "mod.pak");
        assert_eq!(pak_file_name("download.bin"), "download.pak");
        assert_eq!(pak_file_name("Boats.pak"), "Boats.pak");
    }

    #[test]
    fn body_is_written_with_progress() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("body.bin");
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |update: DownloadProgress| {
            sink.lock().unwrap().push(update.percent);
        });

        let written = write_body(
            Cursor::new(data.clone()),
            Some(data.len() as u64),
            &dest,
            "body.bin",
            ProgressBand::MOD_DOWNLOAD,
            Some(&callback),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last(), Some(&80));
    }

    #[test]
    fn canceled_download_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("partial.bin");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let callback: ProgressCallback = Arc::new(move |_| trigger.cancel());

        let err = write_body(
            Cursor::new(vec![1u8; CHUNK_SIZE * 4]),
            None,
            &dest,
            "partial.bin",
            ProgressBand::MOD_DOWNLOAD,
            Some(&callback),
            &cancel,
        )
        .unwrap_err();
        assert!(crate::error::is_canceled(&err));
        assert!(!dest.exists());
    }

    #[test]
    fn archive_served_as_html_installs_as_archive() {
        let temp = TempDir::new().unwrap();
        let game = temp.path().join("game");
        fs::create_dir_all(game.join("BrickRigs").join("Content")).unwrap();
        let data_dir = temp.path().join("data");
        let mut layout = GameLayout::resolve(&game);

        let staging = importer::make_temp_dir(&data_dir, "download").unwrap();
        let part = staging.join("download.part");
        importer::tests::write_zip(
            &part,
            &[
                ("Tracks/Tracks.uplugin", br#"{"FriendlyName": "Tracks"}"#),
                ("Tracks/Content/Paks/Tracks.pak", b"pak"),
            ],
        );
        let downloaded = Downloaded {
            file_name: "Tracks.zip".to_string(),
            content_type: Some("text/html; charset=utf-8".to_string()),
        };

        let report = {
            let _guard = StagingGuard::new(staging.clone());
            install_downloaded(
                &part,
                &downloaded,
                &mut layout,
                &data_dir,
                None,
                &CancelToken::new(),
            )
            .unwrap()
        };
        assert_eq!(report.len(), 1);
        assert!(game
            .join("BrickRigs")
            .join("Mods")
            .join("Tracks")
            .join("Tracks.uplugin")
            .is_file());
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(data_dir.join("tmp")).unwrap().count(), 0);
    }
}
