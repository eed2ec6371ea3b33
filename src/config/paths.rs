//! XDG-compliant path management

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Manages all application paths. Defaults to XDG base directories; a
/// portable root keeps everything under one folder instead.
#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    /// XDG paths: ~/.config/modlink/ and ~/.local/share/modlink/
    pub fn new() -> Self {
        let dirs = ProjectDirs::from("", "", "modlink")
            .expect("Failed to determine project directories");
        Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
        }
    }

    /// Portable mode: everything under `root`.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    // ========== Config Paths ==========

    /// Config directory: ~/.config/modlink/
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Main config file: ~/.config/modlink/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    // ========== Data Paths ==========

    /// Data directory: ~/.local/share/modlink/
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Mod staging directory: ~/.local/share/modlink/staging/
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Staging directory for a specific mod
    pub fn mod_staging_dir(&self, mod_key: &str) -> PathBuf {
        self.staging_dir().join(mod_key)
    }

    /// Installation log document: ~/.local/share/modlink/InstallLog.xml
    pub fn install_log_file(&self) -> PathBuf {
        self.data_dir.join("InstallLog.xml")
    }

    /// Overlay document: ~/.local/share/modlink/VirtualModConfig.xml
    pub fn overlay_file(&self) -> PathBuf {
        self.data_dir.join("VirtualModConfig.xml")
    }

    /// Ledger lockfile, held for the duration of a transaction
    pub fn ledger_lock_file(&self) -> PathBuf {
        self.data_dir.join("InstallLog.lock")
    }

    /// Original-file backups: ~/.local/share/modlink/backups/
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Profiles directory: ~/.local/share/modlink/profiles/
    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    /// Profile directory for a specific game
    pub fn game_profiles_dir(&self, game_id: &str) -> PathBuf {
        self.profiles_dir().join(game_id)
    }

    // ========== Utility Methods ==========

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.profiles_dir())?;
        Ok(())
    }
}
