//! Configuration management for modlink
//!
//! Uses XDG-compliant paths:
//! - Config: ~/.config/modlink/config.toml
//! - Data: ~/.local/share/modlink/ (staging, backups, profiles, documents)

mod paths;

pub use paths::Paths;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active game identifier (e.g., "skyrimse")
    pub active_game: Option<String>,

    /// Active profile name
    pub active_profile: Option<String>,

    /// Staging settings
    pub staging: StagingConfig,

    /// Link/deployment settings
    pub deployment: DeploymentConfig,

    /// Paths configuration
    #[serde(skip)]
    pub paths: Paths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_game: None,
            active_profile: None,
            staging: StagingConfig::default(),
            deployment: DeploymentConfig::default(),
            paths: Paths::new(),
        }
    }
}

/// Staging area configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Override for the staging root; defaults to the XDG data dir
    pub root: Option<PathBuf>,

    /// Mirror staging onto the game volume so hard links succeed when the
    /// game sits on a different filesystem
    pub multi_volume: bool,

    /// Mirror folder on the game volume; required when `multi_volume` is set
    pub mirror_dir: Option<PathBuf>,
}

/// Link/deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Preferred link strategy; the engine still falls back as needed
    pub method: LinkMethod,

    /// What to do when another process holds the ledger lock
    pub lock_policy: LockPolicy,

    /// Seconds to keep retrying the ledger lock under `LockPolicy::Block`
    pub lock_timeout_secs: u64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            method: LinkMethod::Symlink,
            lock_policy: LockPolicy::FailFast,
            lock_timeout_secs: 30,
        }
    }
}

/// Preferred link strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkMethod {
    #[default]
    Symlink,
    Hardlink,
    Copy,
}

/// Cross-process ledger lock policy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Error immediately when the lock is held elsewhere
    #[default]
    FailFast,
    /// Retry until the lock frees up or the timeout elapses
    Block,
}

impl Config {
    /// Load configuration from disk or create default
    pub async fn load() -> Result<Self> {
        let paths = Paths::new();
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save().await?;
            config
        };

        config.paths = paths;
        config.normalize();
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self) -> Result<()> {
        let config_path = self.paths.config_file();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Repair inconsistent states the legacy writer is known to produce.
    /// A multi-volume flag without a mirror folder is treated as disabled.
    pub fn normalize(&mut self) {
        if self.staging.multi_volume && self.staging.mirror_dir.is_none() {
            tracing::warn!("multi_volume set without mirror_dir; disabling multi-volume mode");
            self.staging.multi_volume = false;
        }
    }

    /// Root of the staging area (per-mod folders live underneath).
    pub fn staging_root(&self) -> PathBuf {
        self.staging
            .root
            .clone()
            .unwrap_or_else(|| self.paths.staging_dir())
    }

    /// Mirror staging folder on the game volume, when multi-volume mode is on.
    pub fn mirror_root(&self) -> Option<&PathBuf> {
        if self.staging.multi_volume {
            self.staging.mirror_dir.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_volume_without_mirror_is_disabled_on_load() {
        let mut config = Config {
            staging: StagingConfig {
                multi_volume: true,
                mirror_dir: None,
                ..Default::default()
            },
            ..Default::default()
        };
        config.normalize();
        assert!(!config.staging.multi_volume);
    }

    #[test]
    fn multi_volume_with_mirror_survives_normalization() {
        let mut config = Config {
            staging: StagingConfig {
                multi_volume: true,
                mirror_dir: Some(PathBuf::from("/mnt/games/mirror")),
                ..Default::default()
            },
            ..Default::default()
        };
        config.normalize();
        assert!(config.staging.multi_volume);
        assert!(config.mirror_root().is_some());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.deployment.method, LinkMethod::Symlink);
        assert_eq!(parsed.deployment.lock_policy, LockPolicy::FailFast);
    }
}
