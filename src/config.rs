//! Config module - User settings (config.json) and application paths.
//!
//! The config file holds only two values:
//! - `save_path`: the game root directory (contains `saves/`, `mods/`, ...)
//! - `save_folder`: name of the save directory under `saves/` to sync

use crate::error::{Result, SyncError};
use crate::layout::GameLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "MCDRIVE_CONFIG_DIR";

/// User settings persisted to `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Game root directory
    #[serde(default)]
    pub save_path: String,

    /// Save directory name under `<save_path>/saves`
    #[serde(default)]
    pub save_folder: String,
}

impl AppConfig {
    pub fn new(save_path: impl Into<String>, save_folder: impl Into<String>) -> Self {
        Self {
            save_path: save_path.into(),
            save_folder: save_folder.into(),
        }
    }

    /// Load config from file. A missing file yields the empty config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        info!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::fs(path, e))?;
        let config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            SyncError::Config(format!("Cannot parse config file {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Save config to file, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| SyncError::fs(path, e))?;
        info!("Config saved to {}", path.display());

        Ok(())
    }

    /// Both values are set (whitespace does not count).
    pub fn is_complete(&self) -> bool {
        !self.save_path.trim().is_empty() && !self.save_folder.trim().is_empty()
    }

    /// Resolve the local directory layout. Fails with `State` if incomplete.
    pub fn layout(&self) -> Result<GameLayout> {
        if !self.is_complete() {
            return Err(SyncError::State(
                "save_path and save_folder must both be configured".to_string(),
            ));
        }

        let folder = self.save_folder.trim();
        if folder.contains(['/', '\\']) || folder == "." || folder == ".." {
            return Err(SyncError::Config(format!(
                "save_folder must be a plain directory name, got '{}'",
                folder
            )));
        }

        Ok(GameLayout::new(PathBuf::from(self.save_path.trim()), folder))
    }
}

/// Location of every file the tool persists.
#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
}

impl AppPaths {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Explicit directory, else `$MCDRIVE_CONFIG_DIR`, else the platform default.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let dir = explicit
            .or_else(|| std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(default_config_dir);
        Self::new(dir)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Cached OAuth credential
    pub fn token_file(&self) -> PathBuf {
        self.config_dir.join("token.json")
    }

    /// OAuth client secret downloaded from the Google Cloud console
    pub fn client_secret_file(&self) -> PathBuf {
        self.config_dir.join("credentials.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("mcdrive.log")
    }

    /// Credential used by `--offline`, kept apart from the Google token
    pub fn offline_token_file(&self) -> PathBuf {
        self.config_dir.join("offline-token.json")
    }

    /// Files written by `--offline` transfers
    pub fn offline_drive_dir(&self) -> PathBuf {
        self.config_dir.join("offline-drive")
    }
}

/// Default config directory (~/.config/mcdrive-sync/)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("mcdrive-sync"))
        .unwrap_or_else(|| PathBuf::from("config"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_round_trip() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("config.json");

        let config = AppConfig::new("/a/b", "world1");
        config.save(&path)?;

        let loaded = AppConfig::load(&path)?;
        assert_eq!(loaded.save_path, "/a/b");
        assert_eq!(loaded.save_folder, "world1");

        Ok(())
    }

    #[test]
    fn test_missing_file_is_empty_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let loaded = AppConfig::load(&temp_dir.path().join("config.json"))?;
        assert_eq!(loaded, AppConfig::default());
        assert!(!loaded.is_complete());
        Ok(())
    }

    #[test]
    fn test_absent_keys_default_to_empty() -> anyhow::Result<()> {
        let config: AppConfig = serde_json::from_str(r#"{"save_path": "/games/mc"}"#)?;
        assert_eq!(config.save_path, "/games/mc");
        assert_eq!(config.save_folder, "");
        Ok(())
    }

    #[test]
    fn test_layout_requires_both_values() {
        let config = AppConfig::new("/games/mc", "  ");
        assert!(matches!(config.layout(), Err(SyncError::State(_))));

        let config = AppConfig::new("/games/mc", "../escape");
        assert!(matches!(config.layout(), Err(SyncError::Config(_))));

        let layout = AppConfig::new("/games/mc", "world1").layout().unwrap();
        assert_eq!(layout.save_folder(), "world1");
    }

    #[test]
    fn test_paths_live_in_config_dir() {
        let paths = AppPaths::new("/tmp/mcdrive");
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/mcdrive/config.json"));
        assert_eq!(paths.token_file(), PathBuf::from("/tmp/mcdrive/token.json"));
        assert_eq!(
            paths.client_secret_file(),
            PathBuf::from("/tmp/mcdrive/credentials.json")
        );
        assert_ne!(paths.offline_token_file(), paths.token_file());
        assert!(paths.offline_drive_dir().starts_with("/tmp/mcdrive"));
    }
}
