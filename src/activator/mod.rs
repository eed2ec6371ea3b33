//! Virtual mod activator state
//!
//! The authoritative in-memory overlay: which files each mod stages, at
//! what priority, and which mods are currently active. Ownership decisions
//! are delegated to the ledger through the narrow [`OwnershipOracle`] seam;
//! the ledger in turn sees activation state only through
//! [`crate::ledger::ActiveModSet`]. Reconciliation with the on-disk game
//! directory is driven by the transaction layer, which consults
//! [`Overlay::winner_for`] to decide what to materialize.

pub mod document;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::ledger::{ActiveModSet, InstallLog, ModKey};
use crate::paths::NormalizedPath;

/// Narrow view of the ledger the activator needs for winner computation.
pub trait OwnershipOracle {
    /// The currently-winning installer for `path`.
    fn owner_of(&self, path: &NormalizedPath) -> Option<ModKey>;
    /// Position of `key` in the installer stack for `path`; later
    /// insertions get higher indices.
    fn insertion_index(&self, path: &NormalizedPath, key: &ModKey) -> Option<usize>;
}

impl OwnershipOracle for InstallLog {
    fn owner_of(&self, path: &NormalizedPath) -> Option<ModKey> {
        self.current_owner(path).cloned()
    }

    fn insertion_index(&self, path: &NormalizedPath, key: &ModKey) -> Option<usize> {
        InstallLog::insertion_index(self, path, key)
    }
}

/// A logical ownership record that may or may not be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualLink {
    pub mod_key: ModKey,
    /// Absolute location of the staged file.
    pub real_path: PathBuf,
    /// Destination relative to the game data root, display-cased.
    pub virtual_path: String,
    /// Signed priority; higher wins.
    pub priority: i32,
    /// Whether this link is currently the materialized winner.
    pub active: bool,
}

impl VirtualLink {
    /// Ledger key for this link's destination.
    pub fn normalized_path(&self) -> NormalizedPath {
        NormalizedPath::new(&self.virtual_path)
    }
}

/// Per-mod overlay metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualModInfo {
    pub mod_id: Option<i64>,
    pub download_id: Option<i64>,
    pub mod_name: String,
    pub mod_file_name: String,
    pub mod_file_path: String,
    pub file_version: String,
}

/// Where a mod sits in the activator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModState {
    /// Unknown to the overlay.
    Unstaged,
    /// Staged and registered, contributing no materializations.
    Staged,
    /// Enabled; its winning links are materialized.
    Active,
}

/// The in-memory overlay document: link registry, per-mod metadata, and
/// the active set.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    links: Vec<VirtualLink>,
    mods: BTreeMap<ModKey, VirtualModInfo>,
    active: BTreeSet<ModKey>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Mod registry ==========

    pub fn upsert_mod(&mut self, key: ModKey, info: VirtualModInfo) {
        self.mods.insert(key, info);
    }

    /// Forget a mod, its metadata, links, and activation flag.
    pub fn remove_mod(&mut self, key: &ModKey) {
        self.mods.remove(key);
        self.active.remove(key);
        self.links.retain(|l| &l.mod_key != key);
    }

    pub fn mod_info(&self, key: &ModKey) -> Option<&VirtualModInfo> {
        self.mods.get(key)
    }

    pub fn mods(&self) -> impl Iterator<Item = (&ModKey, &VirtualModInfo)> {
        self.mods.iter()
    }

    pub fn state_of(&self, key: &ModKey) -> ModState {
        if self.active.contains(key) {
            ModState::Active
        } else if self.mods.contains_key(key) {
            ModState::Staged
        } else {
            ModState::Unstaged
        }
    }

    /// Flip activation. Returns `false` when already in the requested
    /// state. Unknown mods cannot be activated.
    pub fn set_active(&mut self, key: &ModKey, active: bool) -> Result<bool> {
        if !self.mods.contains_key(key) {
            return Err(Error::UnknownMod(key.to_string()));
        }
        Ok(if active {
            self.active.insert(key.clone())
        } else {
            self.active.remove(key)
        })
    }

    // ========== Link registry ==========

    /// Register a link record. Re-registering the same `(mod, path)` pair
    /// replaces the previous record so a record never duplicates.
    pub fn register_link(&mut self, link: VirtualLink) {
        let normalized = link.normalized_path();
        self.links
            .retain(|l| !(l.mod_key == link.mod_key && l.normalized_path() == normalized));
        self.links.push(link);
    }

    /// Drop the `(mod, path)` record, returning it if it existed.
    pub fn unregister_link(&mut self, key: &ModKey, path: &NormalizedPath) -> Option<VirtualLink> {
        let index = self
            .links
            .iter()
            .position(|l| &l.mod_key == key && l.normalized_path() == *path)?;
        Some(self.links.remove(index))
    }

    pub fn link(&self, key: &ModKey, path: &NormalizedPath) -> Option<&VirtualLink> {
        self.links
            .iter()
            .find(|l| &l.mod_key == key && l.normalized_path() == *path)
    }

    pub fn links(&self) -> impl Iterator<Item = &VirtualLink> {
        self.links.iter()
    }

    pub fn links_of(&self, key: &ModKey) -> Vec<&VirtualLink> {
        self.links.iter().filter(|l| &l.mod_key == key).collect()
    }

    pub fn links_for_path(&self, path: &NormalizedPath) -> Vec<&VirtualLink> {
        self.links
            .iter()
            .filter(|l| l.normalized_path() == *path)
            .collect()
    }

    /// Every distinct destination any link claims.
    pub fn claimed_paths(&self) -> BTreeSet<NormalizedPath> {
        self.links.iter().map(|l| l.normalized_path()).collect()
    }

    /// Keys of all currently-enabled mods.
    pub fn active_mods(&self) -> Vec<ModKey> {
        self.active.iter().cloned().collect()
    }

    pub fn set_priority(&mut self, key: &ModKey, path: &NormalizedPath, priority: i32) -> Result<()> {
        let link = self
            .links
            .iter_mut()
            .find(|l| &l.mod_key == key && l.normalized_path() == *path)
            .ok_or_else(|| Error::UnknownMod(format!("{key} has no link for {path}")))?;
        link.priority = priority;
        Ok(())
    }

    /// Record which link is materialized for a path: the winner's `active`
    /// flag is set, every other record for the path is cleared.
    pub fn mark_materialized(&mut self, path: &NormalizedPath, winner: Option<&ModKey>) {
        for link in &mut self.links {
            if link.normalized_path() == *path {
                link.active = Some(&link.mod_key) == winner;
            }
        }
    }

    // ========== Winner computation ==========

    /// The link that should be materialized for `path`: among records whose
    /// mod is active, the maximum `(priority, ledger insertion order)` key.
    /// Equal priorities resolve to the latest insertion, matching stack
    /// ownership.
    pub fn winner_for(
        &self,
        path: &NormalizedPath,
        oracle: &dyn OwnershipOracle,
    ) -> Option<&VirtualLink> {
        self.links
            .iter()
            .filter(|l| l.normalized_path() == *path && self.active.contains(&l.mod_key))
            .max_by_key(|l| {
                (
                    l.priority,
                    oracle.insertion_index(path, &l.mod_key).unwrap_or(0),
                )
            })
    }
}

impl ActiveModSet for Overlay {
    fn is_active(&self, key: &ModKey) -> bool {
        self.active.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ModInfo;

    fn key(s: &str) -> ModKey {
        ModKey::from_raw(s)
    }

    fn link(mod_key: &ModKey, vpath: &str, priority: i32) -> VirtualLink {
        VirtualLink {
            mod_key: mod_key.clone(),
            real_path: PathBuf::from("/staging").join(mod_key.as_str()).join(vpath),
            virtual_path: vpath.to_string(),
            priority,
            active: false,
        }
    }

    fn ledger_with(keys: &[&ModKey], path: &NormalizedPath) -> InstallLog {
        let mut log = InstallLog::new();
        for (i, k) in keys.iter().enumerate() {
            log.insert_mod_entry(crate::ledger::ModEntry {
                key: (*k).clone(),
                archive_path: format!("{i}.7z"),
                display_name: format!("mod {i}"),
                human_version: "1.0".into(),
                machine_version: None,
                install_date: chrono::Utc::now(),
            });
            log.add_file(k, path, false).unwrap();
        }
        log
    }

    #[test]
    fn state_machine_walks_unstaged_staged_active() {
        let mut overlay = Overlay::new();
        let a = key("a");
        assert_eq!(overlay.state_of(&a), ModState::Unstaged);

        overlay.upsert_mod(a.clone(), VirtualModInfo::default());
        assert_eq!(overlay.state_of(&a), ModState::Staged);

        overlay.set_active(&a, true).unwrap();
        assert_eq!(overlay.state_of(&a), ModState::Active);

        overlay.set_active(&a, false).unwrap();
        assert_eq!(overlay.state_of(&a), ModState::Staged);

        overlay.remove_mod(&a);
        assert_eq!(overlay.state_of(&a), ModState::Unstaged);
    }

    #[test]
    fn activating_an_unstaged_mod_is_an_error() {
        let mut overlay = Overlay::new();
        assert!(matches!(
            overlay.set_active(&key("ghost"), true),
            Err(Error::UnknownMod(_))
        ));
    }

    #[test]
    fn reregistering_a_link_replaces_the_record() {
        let mut overlay = Overlay::new();
        let a = key("a");
        overlay.register_link(link(&a, "Textures/Sky.dds", 0));
        overlay.register_link(link(&a, "textures/sky.DDS", 5));

        let p = NormalizedPath::new("textures/sky.dds");
        assert_eq!(overlay.links_for_path(&p).len(), 1);
        assert_eq!(overlay.link(&a, &p).unwrap().priority, 5);
    }

    #[test]
    fn later_insertion_wins_at_equal_priority() {
        let a = key("a");
        let b = key("b");
        let p = NormalizedPath::new("textures/x.dds");
        let log = ledger_with(&[&a, &b], &p);

        let mut overlay = Overlay::new();
        overlay.upsert_mod(a.clone(), VirtualModInfo::default());
        overlay.upsert_mod(b.clone(), VirtualModInfo::default());
        overlay.set_active(&a, true).unwrap();
        overlay.set_active(&b, true).unwrap();
        overlay.register_link(link(&a, "Textures/X.dds", 0));
        overlay.register_link(link(&b, "textures/x.dds", 0));

        assert_eq!(overlay.winner_for(&p, &log).unwrap().mod_key, b);
    }

    #[test]
    fn priority_outranks_insertion_order() {
        let a = key("a");
        let b = key("b");
        let p = NormalizedPath::new("textures/x.dds");
        let log = ledger_with(&[&a, &b], &p);

        let mut overlay = Overlay::new();
        overlay.upsert_mod(a.clone(), VirtualModInfo::default());
        overlay.upsert_mod(b.clone(), VirtualModInfo::default());
        overlay.set_active(&a, true).unwrap();
        overlay.set_active(&b, true).unwrap();
        overlay.register_link(link(&a, "textures/x.dds", 1));
        overlay.register_link(link(&b, "textures/x.dds", 0));

        assert_eq!(overlay.winner_for(&p, &log).unwrap().mod_key, a);
    }

    #[test]
    fn staged_mods_never_win() {
        let a = key("a");
        let b = key("b");
        let p = NormalizedPath::new("textures/x.dds");
        let log = ledger_with(&[&a, &b], &p);

        let mut overlay = Overlay::new();
        overlay.upsert_mod(a.clone(), VirtualModInfo::default());
        overlay.upsert_mod(b.clone(), VirtualModInfo::default());
        overlay.set_active(&a, true).unwrap();
        overlay.register_link(link(&a, "textures/x.dds", 0));
        overlay.register_link(link(&b, "textures/x.dds", 10));

        assert_eq!(overlay.winner_for(&p, &log).unwrap().mod_key, a);
        assert!(!overlay.is_active(&b));
    }

    #[test]
    fn mark_materialized_keeps_one_active_record_per_path() {
        let a = key("a");
        let b = key("b");
        let p = NormalizedPath::new("textures/x.dds");

        let mut overlay = Overlay::new();
        overlay.upsert_mod(a.clone(), VirtualModInfo::default());
        overlay.upsert_mod(b.clone(), VirtualModInfo::default());
        overlay.register_link(link(&a, "textures/x.dds", 0));
        overlay.register_link(link(&b, "textures/x.dds", 0));

        overlay.mark_materialized(&p, Some(&b));
        assert!(!overlay.link(&a, &p).unwrap().active);
        assert!(overlay.link(&b, &p).unwrap().active);

        overlay.mark_materialized(&p, None);
        assert!(!overlay.link(&b, &p).unwrap().active);
    }

    #[test]
    fn oracle_exposes_ledger_insertion_order() {
        let mut log = InstallLog::new();
        let a = log
            .activate_mod(ModInfo {
                archive_path: "a.7z".into(),
                display_name: "A".into(),
                human_version: "1.0".into(),
                machine_version: None,
            })
            .unwrap();
        let p = NormalizedPath::new("x.dds");
        log.add_file(&a, &p, true).unwrap();

        assert_eq!(log.owner_of(&p), Some(a.clone()));
        // Pristine capture sits below the mod
        assert_eq!(OwnershipOracle::insertion_index(&log, &p, &a), Some(1));
    }
}
