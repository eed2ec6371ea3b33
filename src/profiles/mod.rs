//! Profile management
//!
//! A profile is a named mod configuration for one game: which activated
//! mods are enabled and at what link priority. Profiles are JSON documents
//! on disk; switching between them is a single transaction driven by the
//! manager.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;

use crate::activator::Overlay;
use crate::ledger::{ActiveModSet, ModKey};

/// Per-mod settings inside a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMod {
    pub enabled: bool,
    pub priority: i32,
}

/// A named mod configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub description: Option<String>,
    pub game_id: String,
    pub mods: BTreeMap<ModKey, ProfileMod>,
    pub created_at: String,
    pub updated_at: String,
}

impl Profile {
    pub fn new(name: &str, game_id: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            name: name.to_string(),
            description: None,
            game_id: game_id.to_string(),
            mods: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Capture the overlay's current enabled set and priorities.
    pub fn capture(name: &str, game_id: &str, overlay: &Overlay) -> Self {
        let mut profile = Self::new(name, game_id);
        for (key, _) in overlay.mods() {
            let priority = overlay
                .links_of(key)
                .first()
                .map(|l| l.priority)
                .unwrap_or_default();
            profile.mods.insert(
                key.clone(),
                ProfileMod {
                    enabled: overlay.is_active(key),
                    priority,
                },
            );
        }
        profile
    }

    pub fn is_enabled(&self, key: &ModKey) -> bool {
        self.mods.get(key).map(|m| m.enabled).unwrap_or(false)
    }
}

/// Filesystem store for one game's profiles.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// List all profiles for the game.
    pub async fn list(&self) -> Result<Vec<Profile>> {
        let mut profiles = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(profiles),
            Err(e) => return Err(e).context("Failed to read profiles directory"),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str(&content) {
                Ok(profile) => profiles.push(profile),
                Err(e) => tracing::warn!("skipping unreadable profile {}: {e}", path.display()),
            }
        }

        profiles.sort_by(|a: &Profile, b: &Profile| a.name.cmp(&b.name));
        Ok(profiles)
    }

    pub async fn load(&self, name: &str) -> Result<Profile> {
        let path = self.profile_path(name);
        if !path.exists() {
            bail!("Profile '{}' not found", name);
        }
        let content = fs::read_to_string(&path)
            .await
            .context("Failed to read profile")?;
        serde_json::from_str(&content).context("Failed to parse profile")
    }

    pub async fn save(&self, profile: &Profile) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create profiles directory")?;
        let mut profile = profile.clone();
        profile.updated_at = chrono::Utc::now().to_rfc3339();
        let content = serde_json::to_string_pretty(&profile)?;
        fs::write(self.profile_path(&profile.name), content)
            .await
            .context("Failed to write profile")?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.profile_path(name);
        if path.exists() {
            fs::remove_file(path).await.context("Failed to delete profile")?;
        }
        Ok(())
    }
}
