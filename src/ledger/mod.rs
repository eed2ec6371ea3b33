//! Installation log
//!
//! The ownership ledger. For every installed file path, every edited INI
//! key, and every game-specific value it records the ordered stack of mods
//! that claimed it; the tail of a stack is the currently-winning owner.
//! The ledger is pure in-memory state: callers (the transaction layer) are
//! responsible for the filesystem side effects each outcome describes, and
//! for persisting through [`document`].

pub mod document;
mod stack;

pub use stack::InstallerStack;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::paths::NormalizedPath;

/// Reserved pseudo-mod key representing the game's pristine state.
pub const ORIGINAL_VALUES: &str = "ORIGINAL_VALUES";

/// Sentinel literal recorded when an INI key did not exist before the first
/// mod claimed it; restoring it means deleting the key.
pub const INI_ABSENT: &str = "ABSENT";

/// Opaque, stable mod identity. Assigned by the ledger on first activation
/// and never reassigned, even after the mod is removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModKey(String);

impl ModKey {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn original_values() -> Self {
        Self(ORIGINAL_VALUES.to_string())
    }

    pub fn is_original_values(&self) -> bool {
        self.0 == ORIGINAL_VALUES
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External description of a mod being activated or upgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModInfo {
    pub archive_path: String,
    pub display_name: String,
    pub human_version: String,
    pub machine_version: Option<semver::Version>,
}

/// A mod as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEntry {
    pub key: ModKey,
    pub archive_path: String,
    pub display_name: String,
    pub human_version: String,
    pub machine_version: Option<semver::Version>,
    pub install_date: DateTime<Utc>,
}

/// Ledger key for one INI edit: `(file, section, key)`, case-folded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IniKey {
    pub file: String,
    pub section: String,
    pub key: String,
}

impl IniKey {
    pub fn new(file: &str, section: &str, key: &str) -> Self {
        Self {
            file: file.to_lowercase(),
            section: section.to_lowercase(),
            key: key.to_lowercase(),
        }
    }
}

impl fmt::Display for IniKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.file, self.section, self.key)
    }
}

/// Result of `add_file` / `add_ini_edit` / `add_game_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// False when this was an idempotent re-install for the same key.
    pub added: bool,
    /// An `ORIGINAL_VALUES` capture was pushed; the caller must persist the
    /// pristine content it promised existed.
    pub captured_original: bool,
}

/// Result of `remove_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRemove {
    /// False when the key had no entry for this path (safe-retry no-op).
    pub removed: bool,
    /// Owner after removal, when other installers remain.
    pub new_owner: Option<ModKey>,
    /// The stack emptied down to the pristine capture; the caller restores
    /// the backed-up bytes.
    pub restore_original: bool,
    /// The path left the ledger entirely.
    pub entry_cleared: bool,
}

/// What to write back when an INI stack empties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IniRestore {
    /// Restore this pre-existing literal.
    Value(String),
    /// The key did not exist before modding; delete it.
    Absent,
}

/// Result of `remove_ini_edit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniRemove {
    pub removed: bool,
    /// Set when the stack emptied and pristine state must be written back.
    pub restore: Option<IniRestore>,
    pub entry_cleared: bool,
    /// The literal now in force, when another installer took over.
    pub new_value: Option<String>,
}

/// Result of `remove_game_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameValueRemove {
    pub removed: bool,
    pub restore: Option<Vec<u8>>,
    pub entry_cleared: bool,
}

/// Everything a full deactivation touched, for the caller to mirror on disk.
#[derive(Debug, Clone, Default)]
pub struct DeactivateOutcome {
    pub files: Vec<(NormalizedPath, FileRemove)>,
    pub ini: Vec<(IniKey, IniRemove)>,
    pub game_values: Vec<(String, GameValueRemove)>,
}

/// A `(recorded, current)` version pair for a mod whose archive no longer
/// matches what the ledger remembers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDrift {
    pub key: ModKey,
    pub recorded: String,
    pub current: String,
}

/// The set of mods currently enabled in the overlay. Implemented by the
/// activator; the ledger holds only this narrow view.
pub trait ActiveModSet {
    fn is_active(&self, key: &ModKey) -> bool;
}

/// The ownership ledger.
#[derive(Debug, Clone, Default)]
pub struct InstallLog {
    mods: BTreeMap<ModKey, ModEntry>,
    files: BTreeMap<NormalizedPath, InstallerStack<()>>,
    ini_edits: BTreeMap<IniKey, InstallerStack<String>>,
    game_values: BTreeMap<String, InstallerStack<Vec<u8>>>,
    key_counter: u64,
}

impl InstallLog {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Mod lifecycle ==========

    /// Assign a fresh key and enter `info` into the ledger.
    pub fn activate_mod(&mut self, info: ModInfo) -> Result<ModKey> {
        let duplicate = self.mods.values().any(|m| {
            m.archive_path == info.archive_path && m.human_version == info.human_version
        });
        if duplicate {
            return Err(Error::DuplicateMod {
                archive: info.archive_path,
                version: info.human_version,
            });
        }

        let key = self.next_key();
        let entry = ModEntry {
            key: key.clone(),
            archive_path: info.archive_path,
            display_name: info.display_name,
            human_version: info.human_version,
            machine_version: info.machine_version,
            install_date: Utc::now(),
        };
        tracing::info!("activated mod {} as {}", entry.display_name, key);
        self.mods.insert(key.clone(), entry);
        Ok(key)
    }

    /// Remove a mod and every entry it holds in any stack.
    pub fn deactivate_mod(&mut self, key: &ModKey) -> Result<DeactivateOutcome> {
        if key.is_original_values() {
            return Err(Error::InvariantViolation(
                "the pristine pseudo-mod cannot be deactivated".into(),
            ));
        }
        self.require_known(key)?;
        let mut outcome = DeactivateOutcome::default();

        let file_paths: Vec<_> = self
            .files
            .iter()
            .filter(|(_, s)| s.contains(key))
            .map(|(p, _)| p.clone())
            .collect();
        for path in file_paths {
            let removal = self.remove_file(key, &path)?;
            outcome.files.push((path, removal));
        }

        let ini_keys: Vec<_> = self
            .ini_edits
            .iter()
            .filter(|(_, s)| s.contains(key))
            .map(|(k, _)| k.clone())
            .collect();
        for ini_key in ini_keys {
            let removal = self.remove_ini_edit(key, &ini_key)?;
            outcome.ini.push((ini_key, removal));
        }

        let value_names: Vec<_> = self
            .game_values
            .iter()
            .filter(|(_, s)| s.contains(key))
            .map(|(n, _)| n.clone())
            .collect();
        for name in value_names {
            let removal = self.remove_game_value(key, &name)?;
            outcome.game_values.push((name, removal));
        }

        let entry = self.mods.remove(key).expect("checked above");
        tracing::info!("deactivated mod {} ({})", entry.display_name, key);
        Ok(outcome)
    }

    /// Atomic rename/upgrade: assign a new key to `info` and rewrite every
    /// stack entry from `old_key` to it, preserving stack positions.
    pub fn replace_mod(&mut self, old_key: &ModKey, info: ModInfo) -> Result<ModKey> {
        if old_key.is_original_values() {
            return Err(Error::InvariantViolation(
                "the pristine pseudo-mod cannot be replaced".into(),
            ));
        }
        self.require_known(old_key)?;

        let new_key = self.next_key();
        let old = self.mods.remove(old_key).expect("checked above");
        self.mods.insert(
            new_key.clone(),
            ModEntry {
                key: new_key.clone(),
                archive_path: info.archive_path,
                display_name: info.display_name,
                human_version: info.human_version,
                machine_version: info.machine_version,
                install_date: old.install_date,
            },
        );

        for stack in self.files.values_mut() {
            stack.rename(old_key, &new_key);
        }
        for stack in self.ini_edits.values_mut() {
            stack.rename(old_key, &new_key);
        }
        for stack in self.game_values.values_mut() {
            stack.rename(old_key, &new_key);
        }

        tracing::info!("replaced mod {} with {}", old_key, new_key);
        Ok(new_key)
    }

    // ========== File stacks ==========

    /// Record that `key` installed `path`. `pre_existing` reports whether
    /// the game directory already held real content at this path; on first
    /// claim that pushes the `ORIGINAL_VALUES` capture to the bottom.
    pub fn add_file(
        &mut self,
        key: &ModKey,
        path: &NormalizedPath,
        pre_existing: bool,
    ) -> Result<AddOutcome> {
        self.require_known(key)?;

        let stack = self.files.entry(path.clone()).or_default();
        let mut captured_original = false;
        if stack.is_empty() && pre_existing {
            stack.push_bottom(ModKey::original_values(), ());
            captured_original = true;
        }
        let added = stack.push(key.clone(), ());
        Ok(AddOutcome {
            added,
            captured_original,
        })
    }

    /// Remove the `(key, path)` entry wherever it sits in the stack.
    pub fn remove_file(&mut self, key: &ModKey, path: &NormalizedPath) -> Result<FileRemove> {
        if key.is_original_values() {
            return Err(Error::InvariantViolation(format!(
                "refusing to remove the pristine capture for {path}"
            )));
        }
        self.require_known(key)?;

        let Some(stack) = self.files.get_mut(path) else {
            return Ok(FileRemove {
                removed: false,
                new_owner: None,
                restore_original: false,
                entry_cleared: false,
            });
        };

        let removed = stack.remove(key).is_some();
        if !removed {
            return Ok(FileRemove {
                removed: false,
                new_owner: stack.owner().cloned(),
                restore_original: false,
                entry_cleared: false,
            });
        }

        if stack.only_original_remains() {
            self.files.remove(path);
            Ok(FileRemove {
                removed: true,
                new_owner: None,
                restore_original: true,
                entry_cleared: true,
            })
        } else if stack.is_empty() {
            self.files.remove(path);
            Ok(FileRemove {
                removed: true,
                new_owner: None,
                restore_original: false,
                entry_cleared: true,
            })
        } else {
            Ok(FileRemove {
                removed: true,
                new_owner: stack.owner().cloned(),
                restore_original: false,
                entry_cleared: false,
            })
        }
    }

    /// The currently-winning installer for `path`, ignoring activation state.
    pub fn current_owner(&self, path: &NormalizedPath) -> Option<&ModKey> {
        self.files.get(path)?.owner()
    }

    pub fn previous_owner(&self, path: &NormalizedPath) -> Option<&ModKey> {
        self.files.get(path)?.previous()
    }

    /// Ordered installer list for `path`, oldest first.
    pub fn installers_of(&self, path: &NormalizedPath) -> Vec<ModKey> {
        self.files
            .get(path)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Zero-based insertion index of `key` in the stack for `path`.
    pub fn insertion_index(&self, path: &NormalizedPath, key: &ModKey) -> Option<usize> {
        self.files.get(path)?.position(key)
    }

    /// Every path currently carrying an entry for `key`.
    pub fn files_of(&self, key: &ModKey) -> Vec<NormalizedPath> {
        self.files
            .iter()
            .filter(|(_, s)| s.contains(key))
            .map(|(p, _)| p.clone())
            .collect()
    }

    // ========== INI stacks ==========

    /// Record an INI edit. `pre_existing` is the literal currently in the
    /// file, or `None` when the key is not present; either way the first
    /// claim captures pristine state at the bottom of the stack (`ABSENT`
    /// marks a key to delete on restore). Re-editing by the same mod
    /// replaces its recorded literal in place.
    pub fn add_ini_edit(
        &mut self,
        key: &ModKey,
        ini_key: &IniKey,
        value: String,
        pre_existing: Option<String>,
    ) -> Result<AddOutcome> {
        self.require_known(key)?;

        let stack = self.ini_edits.entry(ini_key.clone()).or_default();
        let mut captured_original = false;
        if stack.is_empty() {
            let original = pre_existing.unwrap_or_else(|| INI_ABSENT.to_string());
            stack.push_bottom(ModKey::original_values(), original);
            captured_original = true;
        }
        let added = stack.push(key.clone(), value.clone());
        if !added {
            stack.set_value(key, value);
        }
        Ok(AddOutcome {
            added,
            captured_original,
        })
    }

    pub fn remove_ini_edit(&mut self, key: &ModKey, ini_key: &IniKey) -> Result<IniRemove> {
        if key.is_original_values() {
            return Err(Error::InvariantViolation(format!(
                "refusing to remove the pristine capture for {ini_key}"
            )));
        }
        self.require_known(key)?;

        let Some(stack) = self.ini_edits.get_mut(ini_key) else {
            return Ok(IniRemove {
                removed: false,
                restore: None,
                entry_cleared: false,
                new_value: None,
            });
        };

        let removed = stack.remove(key).is_some();
        if !removed {
            return Ok(IniRemove {
                removed: false,
                restore: None,
                entry_cleared: false,
                new_value: None,
            });
        }

        if stack.only_original_remains() {
            let original = stack.owner_value().cloned().expect("non-empty");
            self.ini_edits.remove(ini_key);
            let restore = if original == INI_ABSENT {
                IniRestore::Absent
            } else {
                IniRestore::Value(original)
            };
            Ok(IniRemove {
                removed: true,
                restore: Some(restore),
                entry_cleared: true,
                new_value: None,
            })
        } else if stack.is_empty() {
            self.ini_edits.remove(ini_key);
            Ok(IniRemove {
                removed: true,
                restore: None,
                entry_cleared: true,
                new_value: None,
            })
        } else {
            Ok(IniRemove {
                removed: true,
                restore: None,
                entry_cleared: false,
                new_value: stack.owner_value().cloned(),
            })
        }
    }

    /// The literal currently in force for `ini_key`, if any mod edited it.
    pub fn current_ini_value(&self, ini_key: &IniKey) -> Option<&str> {
        self.ini_edits
            .get(ini_key)?
            .owner_value()
            .map(String::as_str)
    }

    pub fn ini_installers_of(&self, ini_key: &IniKey) -> Vec<ModKey> {
        self.ini_edits
            .get(ini_key)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every INI key currently carrying an entry for `key`.
    pub fn ini_edits_of(&self, key: &ModKey) -> Vec<IniKey> {
        self.ini_edits
            .iter()
            .filter(|(_, s)| s.contains(key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// The owner currently in force for `ini_key`.
    pub fn current_ini_owner(&self, ini_key: &IniKey) -> Option<&ModKey> {
        self.ini_edits.get(ini_key)?.owner()
    }

    /// Whether the bottom of the file stack for `path` is the pristine
    /// capture.
    pub fn has_original(&self, path: &NormalizedPath) -> bool {
        self.files
            .get(path)
            .and_then(|s| s.keys().next())
            .map(|k| k.is_original_values())
            .unwrap_or(false)
    }

    // ========== Game-specific value stacks ==========

    /// Record an opaque per-game value. The pristine blob is captured only
    /// when one existed, mirroring file semantics.
    pub fn add_game_value(
        &mut self,
        key: &ModKey,
        name: &str,
        value: Vec<u8>,
        pre_existing: Option<Vec<u8>>,
    ) -> Result<AddOutcome> {
        self.require_known(key)?;

        let stack = self.game_values.entry(name.to_string()).or_default();
        let mut captured_original = false;
        if stack.is_empty() {
            if let Some(original) = pre_existing {
                stack.push_bottom(ModKey::original_values(), original);
                captured_original = true;
            }
        }
        let added = stack.push(key.clone(), value.clone());
        if !added {
            stack.set_value(key, value);
        }
        Ok(AddOutcome {
            added,
            captured_original,
        })
    }

    pub fn remove_game_value(&mut self, key: &ModKey, name: &str) -> Result<GameValueRemove> {
        if key.is_original_values() {
            return Err(Error::InvariantViolation(format!(
                "refusing to remove the pristine capture for game value {name}"
            )));
        }
        self.require_known(key)?;

        let Some(stack) = self.game_values.get_mut(name) else {
            return Ok(GameValueRemove {
                removed: false,
                restore: None,
                entry_cleared: false,
            });
        };

        let removed = stack.remove(key).is_some();
        if !removed {
            return Ok(GameValueRemove {
                removed: false,
                restore: None,
                entry_cleared: false,
            });
        }

        if stack.only_original_remains() {
            let original = stack.owner_value().cloned().expect("non-empty");
            self.game_values.remove(name);
            Ok(GameValueRemove {
                removed: true,
                restore: Some(original),
                entry_cleared: true,
            })
        } else if stack.is_empty() {
            self.game_values.remove(name);
            Ok(GameValueRemove {
                removed: true,
                restore: None,
                entry_cleared: true,
            })
        } else {
            Ok(GameValueRemove {
                removed: true,
                restore: None,
                entry_cleared: false,
            })
        }
    }

    pub fn current_game_value(&self, name: &str) -> Option<&[u8]> {
        self.game_values.get(name)?.owner_value().map(Vec::as_slice)
    }

    // ========== Queries ==========

    pub fn get_mod(&self, key: &ModKey) -> Option<&ModEntry> {
        self.mods.get(key)
    }

    pub fn contains_mod(&self, key: &ModKey) -> bool {
        self.mods.contains_key(key)
    }

    /// All recorded mods, keyed order.
    pub fn mods(&self) -> impl Iterator<Item = &ModEntry> {
        self.mods.values()
    }

    /// Ledger-recorded versions that no longer match the current archive
    /// metadata, as `(recorded, current)` pairs per active mod.
    pub fn mismatched_versions<F>(
        &self,
        active: &dyn ActiveModSet,
        current_version: F,
    ) -> Vec<VersionDrift>
    where
        F: Fn(&ModEntry) -> Option<String>,
    {
        self.mods
            .values()
            .filter(|m| active.is_active(&m.key))
            .filter_map(|m| {
                let current = current_version(m)?;
                if current != m.human_version {
                    Some(VersionDrift {
                        key: m.key.clone(),
                        recorded: m.human_version.clone(),
                        current,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Check the structural invariants every valid history preserves: no
    /// stack is empty and no stack holds two entries for one key.
    pub fn validate(&self) -> Result<()> {
        fn check(stacks: impl Iterator<Item = (String, usize, usize)>) -> Result<()> {
            for (name, len, distinct) in stacks {
                if len == 0 {
                    return Err(Error::InvariantViolation(format!("empty stack for {name}")));
                }
                if len != distinct {
                    return Err(Error::InvariantViolation(format!(
                        "duplicate installer in stack for {name}"
                    )));
                }
            }
            Ok(())
        }

        check(self.files.iter().map(|(p, s)| {
            let distinct: std::collections::BTreeSet<_> = s.keys().collect();
            (p.to_string(), s.len(), distinct.len())
        }))?;
        check(self.ini_edits.iter().map(|(k, s)| {
            let distinct: std::collections::BTreeSet<_> = s.keys().collect();
            (k.to_string(), s.len(), distinct.len())
        }))?;
        check(self.game_values.iter().map(|(n, s)| {
            let distinct: std::collections::BTreeSet<_> = s.keys().collect();
            (n.clone(), s.len(), distinct.len())
        }))
    }

    // ========== Internals ==========

    fn require_known(&self, key: &ModKey) -> Result<()> {
        if key.is_original_values() || self.mods.contains_key(key) {
            Ok(())
        } else {
            Err(Error::UnknownMod(key.to_string()))
        }
    }

    /// Keys are the ISO date of first activation plus a monotonically
    /// increasing base-36 counter; the counter is persisted with the
    /// document so keys are never reused after deletion.
    fn next_key(&mut self) -> ModKey {
        self.key_counter += 1;
        ModKey::from_raw(format!(
            "{}-{}",
            Utc::now().format("%Y-%m-%d"),
            to_base36(self.key_counter)
        ))
    }

    pub(crate) fn key_counter(&self) -> u64 {
        self.key_counter
    }

    pub(crate) fn set_key_counter(&mut self, counter: u64) {
        self.key_counter = counter;
    }

    pub(crate) fn files_map(&self) -> &BTreeMap<NormalizedPath, InstallerStack<()>> {
        &self.files
    }

    pub(crate) fn ini_map(&self) -> &BTreeMap<IniKey, InstallerStack<String>> {
        &self.ini_edits
    }

    pub(crate) fn game_values_map(&self) -> &BTreeMap<String, InstallerStack<Vec<u8>>> {
        &self.game_values
    }

    pub(crate) fn insert_mod_entry(&mut self, entry: ModEntry) {
        self.mods.insert(entry.key.clone(), entry);
    }

    pub(crate) fn insert_file_stack(&mut self, path: NormalizedPath, stack: InstallerStack<()>) {
        self.files.insert(path, stack);
    }

    pub(crate) fn insert_ini_stack(&mut self, key: IniKey, stack: InstallerStack<String>) {
        self.ini_edits.insert(key, stack);
    }

    pub(crate) fn insert_game_value_stack(&mut self, name: String, stack: InstallerStack<Vec<u8>>) {
        self.game_values.insert(name, stack);
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(archive: &str, version: &str) -> ModInfo {
        ModInfo {
            archive_path: archive.to_string(),
            display_name: archive.trim_end_matches(".7z").to_string(),
            human_version: version.to_string(),
            machine_version: semver::Version::parse(version).ok(),
        }
    }

    fn path(s: &str) -> NormalizedPath {
        NormalizedPath::new(s)
    }

    struct AllActive;
    impl ActiveModSet for AllActive {
        fn is_active(&self, _: &ModKey) -> bool {
            true
        }
    }

    #[test]
    fn duplicate_activation_is_rejected() {
        let mut log = InstallLog::new();
        log.activate_mod(info("mod-a.7z", "1.0.0")).unwrap();
        assert!(matches!(
            log.activate_mod(info("mod-a.7z", "1.0.0")),
            Err(Error::DuplicateMod { .. })
        ));
        // Same archive, new version is a distinct mod
        log.activate_mod(info("mod-a.7z", "1.1.0")).unwrap();
    }

    #[test]
    fn keys_are_unique_and_dated() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(&Utc::now().format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn simple_install_then_uninstall_clears_the_ledger() {
        // Fresh state, destination absent from the game directory
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let p = path("Data/textures/x.dds");

        let added = log.add_file(&a, &p, false).unwrap();
        assert!(added.added);
        assert!(!added.captured_original);
        assert_eq!(log.installers_of(&p), vec![a.clone()]);
        assert_eq!(log.current_owner(&p), Some(&a));

        let outcome = log.deactivate_mod(&a).unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.files[0].1.entry_cleared);
        assert!(!outcome.files[0].1.restore_original);
        assert!(log.installers_of(&p).is_empty());
        assert!(!log.contains_mod(&a));
    }

    #[test]
    fn conflicting_installs_stack_in_order() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();
        let p = path("Data/textures/x.dds");

        log.add_file(&a, &p, false).unwrap();
        log.add_file(&b, &p, false).unwrap();
        assert_eq!(log.installers_of(&p), vec![a.clone(), b.clone()]);
        assert_eq!(log.current_owner(&p), Some(&b));
        assert_eq!(log.previous_owner(&p), Some(&a));

        let removal = log.remove_file(&b, &p).unwrap();
        assert_eq!(removal.new_owner, Some(a.clone()));
        assert_eq!(log.current_owner(&p), Some(&a));
    }

    #[test]
    fn pre_existing_file_gets_original_capture() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let p = path("Data/meshes/door.nif");

        let added = log.add_file(&a, &p, true).unwrap();
        assert!(added.captured_original);
        assert_eq!(
            log.installers_of(&p),
            vec![ModKey::original_values(), a.clone()]
        );

        let removal = log.remove_file(&a, &p).unwrap();
        assert!(removal.restore_original);
        assert!(removal.entry_cleared);
        assert!(log.installers_of(&p).is_empty());
    }

    #[test]
    fn readding_a_file_is_idempotent() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let p = path("x.dds");

        assert!(log.add_file(&a, &p, false).unwrap().added);
        assert!(!log.add_file(&a, &p, false).unwrap().added);
        assert_eq!(log.installers_of(&p).len(), 1);
    }

    #[test]
    fn removing_an_absent_entry_is_a_no_op() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let removal = log.remove_file(&a, &path("never.dds")).unwrap();
        assert!(!removal.removed);
    }

    #[test]
    fn original_values_cannot_be_removed_directly() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let p = path("Data/skyrim.ini");
        log.add_file(&a, &p, true).unwrap();

        assert!(matches!(
            log.remove_file(&ModKey::original_values(), &p),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn ini_edit_captures_and_restores_the_pre_existing_literal() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let ini = IniKey::new("Skyrim.ini", "Display", "fShadowDistance");

        log.add_ini_edit(&a, &ini, "8000".into(), Some("3000".into()))
            .unwrap();
        assert_eq!(log.current_ini_value(&ini), Some("8000"));
        assert_eq!(
            log.ini_installers_of(&ini),
            vec![ModKey::original_values(), a.clone()]
        );

        let removal = log.remove_ini_edit(&a, &ini).unwrap();
        assert_eq!(removal.restore, Some(IniRestore::Value("3000".into())));
        assert!(removal.entry_cleared);
        assert_eq!(log.current_ini_value(&ini), None);
    }

    #[test]
    fn ini_edit_on_a_fresh_key_restores_to_absent() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let ini = IniKey::new("Skyrim.ini", "Display", "bBrandNew");

        log.add_ini_edit(&a, &ini, "1".into(), None).unwrap();
        let removal = log.remove_ini_edit(&a, &ini).unwrap();
        assert_eq!(removal.restore, Some(IniRestore::Absent));
    }

    #[test]
    fn ini_re_edit_by_the_same_mod_updates_in_place() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();
        let ini = IniKey::new("Skyrim.ini", "Display", "fGamma");

        log.add_ini_edit(&a, &ini, "1.0".into(), None).unwrap();
        log.add_ini_edit(&b, &ini, "1.2".into(), None).unwrap();
        let outcome = log.add_ini_edit(&a, &ini, "1.4".into(), None).unwrap();
        assert!(!outcome.added);

        // b still owns the key; a's recorded literal changed underneath
        assert_eq!(log.current_ini_value(&ini), Some("1.2"));
        let removal = log.remove_ini_edit(&b, &ini).unwrap();
        assert_eq!(removal.new_value.as_deref(), Some("1.4"));
    }

    #[test]
    fn game_values_round_trip_as_bytes() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();

        log.add_game_value(&a, "archive-invalidation", vec![1, 2, 3], Some(vec![0]))
            .unwrap();
        assert_eq!(log.current_game_value("archive-invalidation"), Some(&[1u8, 2, 3][..]));

        let removal = log.remove_game_value(&a, "archive-invalidation").unwrap();
        assert_eq!(removal.restore, Some(vec![0]));
    }

    #[test]
    fn replace_mod_preserves_stack_positions() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();
        let p = path("x.dds");
        log.add_file(&a, &p, false).unwrap();
        log.add_file(&b, &p, false).unwrap();

        let a2 = log.replace_mod(&a, info("a.7z", "2.0.0")).unwrap();
        assert_ne!(a, a2);
        assert!(!log.contains_mod(&a));
        assert_eq!(log.installers_of(&p), vec![a2.clone(), b.clone()]);
        assert_eq!(log.insertion_index(&p, &a2), Some(0));
        assert_eq!(log.get_mod(&a2).unwrap().human_version, "2.0.0");
    }

    #[test]
    fn unknown_mod_is_an_error_for_mutations() {
        let mut log = InstallLog::new();
        let ghost = ModKey::from_raw("2020-01-01-zz");
        assert!(matches!(
            log.add_file(&ghost, &path("x.dds"), false),
            Err(Error::UnknownMod(_))
        ));
        assert!(matches!(log.deactivate_mod(&ghost), Err(Error::UnknownMod(_))));
    }

    #[test]
    fn version_drift_reports_recorded_and_current() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let _b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();

        let drifts = log.mismatched_versions(&AllActive, |m| {
            if m.key == a {
                Some("1.2.0".to_string())
            } else {
                Some(m.human_version.clone())
            }
        });
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].recorded, "1.0.0");
        assert_eq!(drifts[0].current, "1.2.0");
    }

    #[test]
    fn histories_preserve_structural_invariants() {
        let mut log = InstallLog::new();
        let a = log.activate_mod(info("a.7z", "1.0.0")).unwrap();
        let b = log.activate_mod(info("b.7z", "1.0.0")).unwrap();
        let p = path("x.dds");
        log.add_file(&a, &p, true).unwrap();
        log.add_file(&b, &p, false).unwrap();
        log.add_file(&b, &p, false).unwrap();
        log.remove_file(&a, &p).unwrap();
        log.validate().unwrap();
    }
}
