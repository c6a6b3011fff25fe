use crate::error::ModError;
use crate::game;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const GAME_ROOT_ENV: &str = "RIGSMITH_GAME_ROOT";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub game_root: Option<PathBuf>,
    #[serde(default)]
    pub update_feed_url: Option<String>,
    #[serde(default = "default_true")]
    pub confirm_mod_delete: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game_root: None,
            update_feed_url: None,
            confirm_mod_delete: true,
        }
    }
}

impl AppConfig {
    /// Reads `config.json` from `dir`, writing a fresh one on first run.
    pub fn load_or_create_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).context("create app data dir")?;
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let game_root = game::detect_game_root();
        match &game_root {
            Some(root) => info!(path = %root.display(), "detected game directory"),
            None => warn!("could not detect the game directory"),
        }
        let config = AppConfig {
            game_root,
            ..AppConfig::default()
        };
        config.save_in(dir)?;
        Ok(config)
    }

    pub fn save_in(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(dir.join(CONFIG_FILE_NAME), raw).context("write app config")?;
        Ok(())
    }

    /// Game directory for this invocation; the environment override wins.
    pub fn resolved_game_root(&self) -> Result<PathBuf> {
        let root = env::var_os(GAME_ROOT_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.game_root.clone())
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(ModError::GamePathNotSet)?;
        if !root.is_dir() {
            return Err(ModError::GameRootNotFound(root).into());
        }
        Ok(root)
    }
}

fn default_true() -> bool {
    true
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("rigsmith"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn saved_config_round_trips() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig {
            game_root: Some(temp.path().join("game")),
            update_feed_url: Some("https://example.com/version.json".to_string()),
            confirm_mod_delete: false,
        };
        config.save_in(temp.path()).unwrap();
        assert_eq!(AppConfig::load_or_create_in(temp.path()).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.confirm_mod_delete);
    }

    #[test]
    fn unset_or_missing_game_root_is_reported() {
        let temp = TempDir::new().unwrap();
        if env::var_os(GAME_ROOT_ENV).is_some() {
            return;
        }
        let err = AppConfig::default().resolved_game_root().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::GamePathNotSet)
        ));

        let config = AppConfig {
            game_root: Some(temp.path().join("gone")),
            ..AppConfig::default()
        };
        let err = config.resolved_game_root().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModError>(),
            Some(ModError::GameRootNotFound(_))
        ));
    }
}
