use std::path::PathBuf;
use thiserror::Error;

/// Conditions callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum ModError {
    #[error("game path not set; run `rigsmith config set-game <path>`")]
    GamePathNotSet,
    #[error("game directory not found: {}", .0.display())]
    GameRootNotFound(PathBuf),
    #[error("mod directory not found: {}", .0.display())]
    ModDirectoryMissing(PathBuf),
    #[error("pak file not found for mod: {0}")]
    PakNotFound(String),
    #[error("archive does not contain a recognized mod structure (no .uplugin file or standalone .pak files found)")]
    UnrecognizedStructure,
    #[error("unsupported file type: {} (expected .zip, .7z, .pak, .pakbundle or .brmodpack)", .0.display())]
    UnsupportedFile(PathBuf),
    #[error("{}", web_page_message(*.dropbox))]
    WebPage { dropbox: bool },
    #[error("invalid mod pack: {0}")]
    InvalidModPack(String),
    #[error("failed to install pak mod {0}: file not found after installation")]
    InstallVerification(String),
    #[error("operation canceled")]
    Canceled,
}

fn web_page_message(dropbox: bool) -> &'static str {
    if dropbox {
        "the Dropbox link points to a preview page instead of the file; share a direct file link"
    } else {
        "the URL returned a web page instead of a file; check that the link points directly to the file"
    }
}

pub fn is_canceled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ModError>(), Some(ModError::Canceled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn canceled_survives_context_wrapping() {
        let err = Err::<(), _>(ModError::Canceled)
            .context("download mod")
            .unwrap_err();
        assert!(is_canceled(&err));

        let other = anyhow::anyhow!("network down");
        assert!(!is_canceled(&other));
    }
}
