//! Mod manager facade
//!
//! Composite operations over the ledger, the overlay, and the game
//! directory. Every mutating operation opens one transaction: state changes
//! go to the transaction's shadows, filesystem changes are journaled, and
//! commit makes the whole unit durable or nothing at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use walkdir::WalkDir;

use crate::activator::{self, ModState, VirtualLink, VirtualModInfo};
use crate::backup::BackupStore;
use crate::cancel::CancelToken;
use crate::config::{Config, LinkMethod};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::games::GameMode;
use crate::ledger::{
    self, ActiveModSet, IniKey, IniRestore, ModEntry, ModInfo, ModKey, VersionDrift,
};
use crate::link::{self, LinkKind, LinkRequirement};
use crate::paths::{display_form, NormalizedPath};
use crate::profiles::{Profile, ProfileStore};
use crate::txn::{CoreState, FsOp, Replaces, Transaction, TxnContext};

/// Paths and preferences a planning pass needs, captured once per
/// operation.
struct PlanEnv {
    staging_root: PathBuf,
    mirror_root: Option<PathBuf>,
    data_path: PathBuf,
    method: LinkMethod,
}

/// How to leave a destination whose last active claimant just went away.
enum RestorePolicy {
    /// Restore pristine bytes when the ledger still records a capture.
    FromLedger,
    /// Restore unconditionally, optionally deleting the store entry.
    Restore { drop_backup: bool },
}

/// The mod manager: owns the live core state and coordinates every
/// externally triggered operation.
pub struct ModManager {
    config: Arc<RwLock<Config>>,
    game: Arc<dyn GameMode>,
    state: Arc<RwLock<CoreState>>,
    backup: BackupStore,
    events: EventBus,
}

impl ModManager {
    /// Load the persisted ledger and overlay and probe link capability.
    pub async fn load(config: Arc<RwLock<Config>>, game: Arc<dyn GameMode>) -> Result<Self> {
        let (log_path, overlay_path, backups_dir, staging_root) = {
            let cfg = config.read().await;
            cfg.paths.ensure_dirs()?;
            (
                cfg.paths.install_log_file(),
                cfg.paths.overlay_file(),
                cfg.paths.backups_dir(),
                cfg.staging_root(),
            )
        };

        let log = ledger::document::load(&log_path).await?;
        let overlay = activator::document::load(&overlay_path).await?;

        std::fs::create_dir_all(&staging_root)?;
        match link::probe(&staging_root) {
            LinkKind::Copy => tracing::warn!(
                "host supports neither symlinks nor hard links in {}; falling back to copies",
                staging_root.display()
            ),
            kind => tracing::info!("link capability: {kind:?}"),
        }

        Ok(Self {
            config,
            game,
            state: Arc::new(RwLock::new(CoreState { log, overlay })),
            backup: BackupStore::new(backups_dir),
            events: EventBus::default(),
        })
    }

    /// Subscribe to post-commit events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    // ========== Transaction plumbing ==========

    async fn txn_context(&self) -> TxnContext {
        let cfg = self.config.read().await;
        TxnContext {
            lock_path: cfg.paths.ledger_lock_file(),
            lock_policy: cfg.deployment.lock_policy,
            lock_timeout: Duration::from_secs(cfg.deployment.lock_timeout_secs),
            log_path: cfg.paths.install_log_file(),
            overlay_path: cfg.paths.overlay_file(),
            backup: self.backup.clone(),
        }
    }

    async fn begin(&self) -> Result<Transaction<'_>> {
        let ctx = self.txn_context().await;
        Transaction::begin(&self.state, ctx).await
    }

    async fn plan_env(&self) -> PlanEnv {
        let cfg = self.config.read().await;
        PlanEnv {
            staging_root: cfg.staging_root(),
            mirror_root: cfg.mirror_root().cloned(),
            data_path: self.game.data_path().to_path_buf(),
            method: cfg.deployment.method,
        }
    }

    /// Combine the game's per-file constraint with the configured
    /// deployment preference.
    fn effective_requirement(&self, env: &PlanEnv, path: &NormalizedPath) -> LinkRequirement {
        match (env.method, self.game.link_requirement(path)) {
            (LinkMethod::Copy, _) => LinkRequirement::ForceCopy,
            (LinkMethod::Hardlink, LinkRequirement::Any) => LinkRequirement::RequireHard,
            (_, requirement) => requirement,
        }
    }

    // ========== Mod lifecycle ==========

    /// Enter a mod into the ledger and overlay. Staging is populated by the
    /// caller (archive extraction is not core); the mod starts out Staged.
    pub async fn install_mod(&self, info: ModInfo, overlay_info: VirtualModInfo) -> Result<ModKey> {
        let mut txn = self.begin().await?;
        let key = match txn.log.activate_mod(info) {
            Ok(key) => key,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };
        txn.overlay.upsert_mod(key.clone(), overlay_info);
        txn.commit(&self.events).await?;
        Ok(key)
    }

    /// Remove a mod entirely: disable it, restore everything it displaced,
    /// clear its ledger entries, and drop its staging folder.
    pub async fn uninstall_mod(&self, key: &ModKey, cancel: &CancelToken, force: bool) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;

        let was_active = match self.plan_uninstall(&mut txn, &env, key, cancel, force).await {
            Ok(was_active) => was_active,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };
        if was_active {
            txn.queue_event(CoreEvent::ModActivationChanged {
                key: key.clone(),
                active: false,
            });
        }
        txn.commit(&self.events).await?;

        let staging_dir = env.staging_root.join(key.as_str());
        if let Err(e) = tokio::fs::remove_dir_all(&staging_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("could not remove staging folder {}: {e}", staging_dir.display());
            }
        }
        Ok(())
    }

    /// Upgrade a mod in place: new key, same stack positions.
    pub async fn replace_mod(
        &self,
        old_key: &ModKey,
        info: ModInfo,
        overlay_info: VirtualModInfo,
    ) -> Result<ModKey> {
        let mut txn = self.begin().await?;
        let new_key = match txn.log.replace_mod(old_key, info) {
            Ok(key) => key,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };

        let was_active = txn.overlay.is_active(old_key);
        let links: Vec<VirtualLink> = txn.overlay.links_of(old_key).into_iter().cloned().collect();
        txn.overlay.remove_mod(old_key);
        txn.overlay.upsert_mod(new_key.clone(), overlay_info);
        for mut link in links {
            link.mod_key = new_key.clone();
            txn.overlay.register_link(link);
        }
        if was_active {
            txn.overlay.set_active(&new_key, true)?;
        }
        txn.commit(&self.events).await?;
        Ok(new_key)
    }

    // ========== File links ==========

    /// Register a staged file for `key` and materialize it if the mod is
    /// active and wins its destination. Returns the display-cased virtual
    /// path. `switching` suppresses the pristine capture (profile swaps
    /// re-claim paths whose originals are already in the store).
    pub async fn add_file_link(
        &self,
        key: &ModKey,
        base_file_path: &Path,
        switching: bool,
        priority: i32,
    ) -> Result<String> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        match self
            .plan_claim_file(&mut txn, &env, key, base_file_path, switching, priority)
            .await
        {
            Ok(vpath) => {
                txn.commit(&self.events).await?;
                Ok(vpath)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Drop the `(key, virtual_path)` record; if the mod held the
    /// materialization, hand the destination to the next owner or restore
    /// the original.
    pub async fn remove_file_link(&self, key: &ModKey, virtual_path: &str) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        match self.plan_remove_file_link(&mut txn, &env, key, virtual_path) {
            Ok(()) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    // ========== Activation ==========

    /// Enable a mod: claim every file it stages and materialize the links
    /// it wins. Idempotent for already-active mods.
    pub async fn enable_mod(&self, key: &ModKey, cancel: &CancelToken) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        if txn.overlay.state_of(key) == ModState::Active {
            txn.rollback();
            return Ok(());
        }
        match self.plan_enable(&mut txn, &env, key, cancel, false).await {
            Ok(()) => {
                txn.queue_event(CoreEvent::ModActivationChanged {
                    key: key.clone(),
                    active: true,
                });
                txn.commit(&self.events).await
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Disable a mod: remove its materializations, hand contested paths to
    /// the next active owner, restore originals where no owner remains.
    /// Ledger entries stay; the mod returns to Staged.
    pub async fn disable_mod(&self, key: &ModKey, cancel: &CancelToken) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        if txn.overlay.state_of(key) != ModState::Active {
            txn.rollback();
            return Ok(());
        }
        match self.plan_disable(&mut txn, &env, key, cancel, false).await {
            Ok(()) => {
                txn.queue_event(CoreEvent::ModActivationChanged {
                    key: key.clone(),
                    active: false,
                });
                txn.commit(&self.events).await
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Reassign a link's priority and re-materialize its destination if the
    /// winner changed.
    pub async fn update_link_priority(
        &self,
        key: &ModKey,
        virtual_path: &str,
        priority: i32,
    ) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        let norm = NormalizedPath::new(virtual_path);
        let plan = (|| {
            txn.overlay.set_priority(key, &norm, priority)?;
            self.reconcile_path(&mut txn, &env, &norm, RestorePolicy::FromLedger)
        })();
        match plan {
            Ok(()) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Remove every materialization from the game directory, restoring
    /// originals wherever present. Staging and the ledger are untouched;
    /// all mods drop back to Staged.
    pub async fn purge_links(&self, cancel: &CancelToken, force: bool) -> Result<()> {
        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        match self.plan_purge(&mut txn, &env, cancel, force) {
            Ok(()) => {
                txn.queue_event(CoreEvent::LinksPurged);
                txn.commit(&self.events).await
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    // ========== INI edits ==========

    /// Record and apply an INI edit for `key`.
    pub async fn add_ini_edit(
        &self,
        key: &ModKey,
        file: &str,
        section: &str,
        ini_key: &str,
        value: &str,
    ) -> Result<()> {
        let mut txn = self.begin().await?;
        let ik = IniKey::new(file, section, ini_key);
        let file_path = self.game.ini_path(&ik.file);

        let plan = (|| {
            let on_disk = crate::txn::ini::read_value(&file_path, &ik.section, &ik.key)?;
            txn.log
                .add_ini_edit(key, &ik, value.to_string(), on_disk.clone())?;
            // Only the stack owner's literal lands in the file
            if txn.log.current_ini_owner(&ik) == Some(key) {
                txn.queue(FsOp::WriteIni {
                    file: file_path.clone(),
                    section: ik.section.clone(),
                    key: ik.key.clone(),
                    value: Some(value.to_string()),
                    previous: on_disk,
                });
            }
            Ok(())
        })();

        match plan {
            Ok(()) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Remove `key`'s INI edit, restoring the next owner's literal or the
    /// pristine value.
    pub async fn remove_ini_edit(
        &self,
        key: &ModKey,
        file: &str,
        section: &str,
        ini_key: &str,
    ) -> Result<()> {
        let mut txn = self.begin().await?;
        let ik = IniKey::new(file, section, ini_key);

        let plan = self.plan_remove_ini_edit(&mut txn, key, &ik);
        match plan {
            Ok(()) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    // ========== Game-specific values ==========

    /// Record an opaque per-game value for `key`. The caller supplies the
    /// pristine blob when one exists; the ledger only books values, game
    /// collaborators apply them.
    pub async fn add_game_value(
        &self,
        key: &ModKey,
        name: &str,
        value: Vec<u8>,
        pre_existing: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut txn = self.begin().await?;
        match txn.log.add_game_value(key, name, value, pre_existing) {
            Ok(_) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    pub async fn remove_game_value(&self, key: &ModKey, name: &str) -> Result<()> {
        let mut txn = self.begin().await?;
        match txn.log.remove_game_value(key, name) {
            Ok(_) => txn.commit(&self.events).await,
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    // ========== Profiles ==========

    async fn profile_store(&self) -> ProfileStore {
        let cfg = self.config.read().await;
        ProfileStore::new(cfg.paths.game_profiles_dir(self.game.id()))
    }

    /// Snapshot the current enabled set and priorities as a named profile.
    pub async fn save_profile(&self, name: &str) -> Result<Profile> {
        let store = self.profile_store().await;
        let state = self.state.read().await;
        let profile = Profile::capture(name, self.game.id(), &state.overlay);
        drop(state);
        store
            .save(&profile)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(profile)
    }

    /// Switch to a named profile in one transaction: apply its priorities,
    /// disable everything it excludes, enable everything it includes.
    pub async fn switch_profile(&self, name: &str, cancel: &CancelToken) -> Result<()> {
        let store = self.profile_store().await;
        let profile = store
            .load(name)
            .await
            .map_err(|e| Error::Config(e.to_string()))?;

        let env = self.plan_env().await;
        let mut txn = self.begin().await?;
        match self.plan_switch(&mut txn, &env, &profile, cancel).await {
            Ok(()) => {
                txn.queue_event(CoreEvent::ProfileSwitched {
                    name: name.to_string(),
                });
                txn.commit(&self.events).await?;
            }
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        }

        let mut cfg = self.config.write().await;
        cfg.active_profile = Some(name.to_string());
        Ok(())
    }

    // ========== Queries ==========

    pub async fn installers_of(&self, virtual_path: &str) -> Vec<ModKey> {
        let state = self.state.read().await;
        state.log.installers_of(&NormalizedPath::new(virtual_path))
    }

    pub async fn current_owner(&self, virtual_path: &str) -> Option<ModKey> {
        let state = self.state.read().await;
        state
            .log
            .current_owner(&NormalizedPath::new(virtual_path))
            .cloned()
    }

    pub async fn previous_owner(&self, virtual_path: &str) -> Option<ModKey> {
        let state = self.state.read().await;
        state
            .log
            .previous_owner(&NormalizedPath::new(virtual_path))
            .cloned()
    }

    pub async fn files_of(&self, key: &ModKey) -> Vec<NormalizedPath> {
        let state = self.state.read().await;
        state.log.files_of(key)
    }

    pub async fn ini_installers_of(&self, file: &str, section: &str, key: &str) -> Vec<ModKey> {
        let state = self.state.read().await;
        state.log.ini_installers_of(&IniKey::new(file, section, key))
    }

    /// The INI literal currently in force per the ledger, if any mod edited
    /// the key.
    pub async fn ini_value(&self, file: &str, section: &str, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .log
            .current_ini_value(&IniKey::new(file, section, key))
            .map(str::to_string)
    }

    pub async fn mod_state(&self, key: &ModKey) -> ModState {
        let state = self.state.read().await;
        state.overlay.state_of(key)
    }

    /// Sorted snapshot of every recorded mod.
    pub async fn mods(&self) -> Vec<ModEntry> {
        let state = self.state.read().await;
        state.log.mods().cloned().collect()
    }

    /// Ledger-recorded versions that disagree with the overlay's current
    /// archive metadata.
    pub async fn mismatched_versions(&self) -> Vec<VersionDrift> {
        let state = self.state.read().await;
        let overlay = &state.overlay;
        state.log.mismatched_versions(overlay, |entry| {
            overlay
                .mod_info(&entry.key)
                .map(|info| info.file_version.clone())
                .filter(|v| !v.is_empty())
        })
    }

    /// Persist both documents outside a transaction.
    pub async fn save(&self) -> Result<()> {
        let ctx = self.txn_context().await;
        let state = self.state.read().await;
        ledger::document::save(&state.log, &ctx.log_path).await?;
        activator::document::save(&state.overlay, &ctx.overlay_path).await
    }

    // ========== Planning ==========

    async fn plan_claim_file(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        key: &ModKey,
        base_file_path: &Path,
        switching: bool,
        priority: i32,
    ) -> Result<String> {
        let adjusted = self.game.adjust_path(base_file_path);
        let vpath = display_form(&adjusted);
        let norm = NormalizedPath::new(&adjusted);
        let real = env.staging_root.join(key.as_str()).join(base_file_path);

        if !real.exists() {
            return Err(Error::StagingCorrupt(real));
        }

        // A re-claim keeps the priority the link already carries
        let priority = txn
            .overlay
            .link(key, &norm)
            .map(|l| l.priority)
            .unwrap_or(priority);
        txn.overlay.register_link(VirtualLink {
            mod_key: key.clone(),
            real_path: real,
            virtual_path: vpath.clone(),
            priority,
            active: false,
        });

        let dst = env.data_path.join(&vpath);
        let pre_existing = !switching
            && txn.log.installers_of(&norm).is_empty()
            && std::fs::symlink_metadata(&dst).is_ok();

        let outcome = txn.log.add_file(key, &norm, pre_existing)?;
        if outcome.captured_original {
            txn.queue(FsOp::BackupOriginal {
                path: norm.clone(),
                source: dst,
            });
        }

        self.reconcile_path(txn, env, &norm, RestorePolicy::FromLedger)?;
        Ok(vpath)
    }

    fn plan_remove_file_link(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        key: &ModKey,
        virtual_path: &str,
    ) -> Result<()> {
        let norm = NormalizedPath::new(virtual_path);
        let removed = txn.overlay.unregister_link(key, &norm);
        let outcome = txn.log.remove_file(key, &norm)?;

        match removed {
            Some(link) if link.active => {
                self.queue_remove(txn, env, &link, false);
                txn.overlay.mark_materialized(&norm, None);
                if outcome.restore_original {
                    self.queue_restore(
                        txn,
                        env,
                        &norm,
                        &link.virtual_path,
                        RestorePolicy::Restore { drop_backup: true },
                    );
                } else {
                    self.reconcile_path(txn, env, &norm, RestorePolicy::FromLedger)?;
                }
            }
            _ => {
                // The pristine file never left the game directory
                if outcome.restore_original {
                    txn.queue(FsOp::DropBackup { path: norm });
                }
            }
        }
        Ok(())
    }

    async fn plan_enable(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        key: &ModKey,
        cancel: &CancelToken,
        switching: bool,
    ) -> Result<()> {
        txn.overlay.set_active(key, true)?;

        let staging_dir = env.staging_root.join(key.as_str());
        if !staging_dir.is_dir() {
            return Err(Error::StagingCorrupt(staging_dir));
        }

        for entry in WalkDir::new(&staging_dir).sort_by_file_name() {
            let entry = entry
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            cancel.check()?;

            let base = entry
                .path()
                .strip_prefix(&staging_dir)
                .expect("walk entries live under the staging dir")
                .to_path_buf();
            self.plan_claim_file(txn, env, key, &base, switching, 0).await?;
        }
        Ok(())
    }

    async fn plan_disable(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        key: &ModKey,
        cancel: &CancelToken,
        force: bool,
    ) -> Result<()> {
        txn.overlay.set_active(key, false)?;

        let links: Vec<VirtualLink> = txn.overlay.links_of(key).into_iter().cloned().collect();
        for link in links {
            cancel.check()?;
            if !link.active {
                continue;
            }
            let norm = link.normalized_path();
            self.queue_remove(txn, env, &link, force);
            txn.overlay.mark_materialized(&norm, None);
            self.reconcile_path(txn, env, &norm, RestorePolicy::FromLedger)?;
        }
        Ok(())
    }

    async fn plan_uninstall(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        key: &ModKey,
        cancel: &CancelToken,
        force: bool,
    ) -> Result<bool> {
        let was_active = txn.overlay.state_of(key) == ModState::Active;
        if was_active {
            self.plan_disable(txn, env, key, cancel, force).await?;
        }

        let ini_keys = txn.log.ini_edits_of(key);
        let owned_before: Vec<IniKey> = ini_keys
            .iter()
            .filter(|ik| txn.log.current_ini_owner(ik) == Some(key))
            .cloned()
            .collect();

        let outcome = txn.log.deactivate_mod(key)?;

        for (path, removal) in &outcome.files {
            cancel.check()?;
            if removal.restore_original {
                // plan_disable already restored the bytes (or they never
                // left); only the store entry remains to clean up
                txn.queue(FsOp::DropBackup { path: path.clone() });
            }
        }

        for (ik, removal) in &outcome.ini {
            let file = self.game.ini_path(&ik.file);
            let previous = crate::txn::ini::read_value(&file, &ik.section, &ik.key)?;
            if let Some(restore) = &removal.restore {
                let value = match restore {
                    IniRestore::Value(v) => Some(v.clone()),
                    IniRestore::Absent => None,
                };
                txn.queue(FsOp::WriteIni {
                    file,
                    section: ik.section.clone(),
                    key: ik.key.clone(),
                    value,
                    previous,
                });
            } else if owned_before.contains(ik) {
                if let Some(new_value) = &removal.new_value {
                    txn.queue(FsOp::WriteIni {
                        file,
                        section: ik.section.clone(),
                        key: ik.key.clone(),
                        value: Some(new_value.clone()),
                        previous,
                    });
                }
            }
        }

        txn.overlay.remove_mod(key);
        Ok(was_active)
    }

    fn plan_remove_ini_edit(
        &self,
        txn: &mut Transaction<'_>,
        key: &ModKey,
        ik: &IniKey,
    ) -> Result<()> {
        let was_owner = txn.log.current_ini_owner(ik) == Some(key);
        let removal = txn.log.remove_ini_edit(key, ik)?;

        let file = self.game.ini_path(&ik.file);
        let previous = crate::txn::ini::read_value(&file, &ik.section, &ik.key)?;

        if let Some(restore) = &removal.restore {
            let value = match restore {
                IniRestore::Value(v) => Some(v.clone()),
                IniRestore::Absent => None,
            };
            txn.queue(FsOp::WriteIni {
                file,
                section: ik.section.clone(),
                key: ik.key.clone(),
                value,
                previous,
            });
        } else if was_owner {
            if let Some(new_value) = &removal.new_value {
                txn.queue(FsOp::WriteIni {
                    file,
                    section: ik.section.clone(),
                    key: ik.key.clone(),
                    value: Some(new_value.clone()),
                    previous,
                });
            }
        }
        Ok(())
    }

    fn plan_purge(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        cancel: &CancelToken,
        force: bool,
    ) -> Result<()> {
        for path in txn.overlay.claimed_paths() {
            cancel.check()?;
            let materialized = txn
                .overlay
                .links_for_path(&path)
                .into_iter()
                .find(|l| l.active)
                .cloned();
            if let Some(link) = materialized {
                self.queue_remove(txn, env, &link, force);
                if txn.log.has_original(&path) {
                    txn.queue(FsOp::RestoreOriginal {
                        path: path.clone(),
                        dst: env.data_path.join(&link.virtual_path),
                        drop_backup: false,
                    });
                }
            }
            txn.overlay.mark_materialized(&path, None);
        }

        for key in txn.overlay.active_mods() {
            txn.overlay.set_active(&key, false)?;
            txn.queue_event(CoreEvent::ModActivationChanged { key, active: false });
        }
        Ok(())
    }

    async fn plan_switch(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        profile: &Profile,
        cancel: &CancelToken,
    ) -> Result<()> {
        let keys: Vec<ModKey> = txn.overlay.mods().map(|(k, _)| k.clone()).collect();

        // Priorities first so activation changes compute final winners
        for key in &keys {
            if let Some(settings) = profile.mods.get(key) {
                let paths: Vec<NormalizedPath> = txn
                    .overlay
                    .links_of(key)
                    .iter()
                    .map(|l| l.normalized_path())
                    .collect();
                for path in paths {
                    txn.overlay.set_priority(key, &path, settings.priority)?;
                }
            }
        }

        for key in &keys {
            if txn.overlay.is_active(key) && !profile.is_enabled(key) {
                self.plan_disable(txn, env, key, cancel, false).await?;
                txn.queue_event(CoreEvent::ModActivationChanged {
                    key: key.clone(),
                    active: false,
                });
            }
        }

        for key in &keys {
            if !txn.overlay.is_active(key) && profile.is_enabled(key) {
                self.plan_enable(txn, env, key, cancel, true).await?;
                txn.queue_event(CoreEvent::ModActivationChanged {
                    key: key.clone(),
                    active: true,
                });
            }
        }

        // Catch pure priority changes on mods active in both configurations
        let claimed: Vec<NormalizedPath> = txn.overlay.claimed_paths().into_iter().collect();
        for path in claimed {
            cancel.check()?;
            self.reconcile_path(txn, env, &path, RestorePolicy::FromLedger)?;
        }
        Ok(())
    }

    // ========== Materialization helpers ==========

    /// Bring one destination in line with the computed winner: remove a
    /// stale materialization, create the winning link, or restore pristine
    /// content when no active claimant remains.
    fn reconcile_path(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        path: &NormalizedPath,
        restore: RestorePolicy,
    ) -> Result<()> {
        let current = txn
            .overlay
            .links_for_path(path)
            .into_iter()
            .find(|l| l.active)
            .cloned();
        let winner = txn.overlay.winner_for(path, &txn.log).cloned();

        match (&current, &winner) {
            (Some(old), Some(new)) if old.mod_key == new.mod_key => {}
            (Some(old), Some(new)) => {
                self.queue_remove(txn, env, old, false);
                self.queue_create(txn, env, new, Replaces::Nothing);
            }
            (Some(old), None) => {
                self.queue_remove(txn, env, old, false);
                self.queue_restore(txn, env, path, &old.virtual_path, restore);
            }
            (None, Some(new)) => {
                let replaces = if txn.log.has_original(path) {
                    Replaces::Original { path: path.clone() }
                } else {
                    Replaces::Nothing
                };
                self.queue_create(txn, env, new, replaces);
            }
            (None, None) => {
                let display = txn
                    .overlay
                    .links_for_path(path)
                    .first()
                    .map(|l| l.virtual_path.clone())
                    .unwrap_or_else(|| path.as_str().to_string());
                self.queue_restore(txn, env, path, &display, restore);
            }
        }

        txn.overlay
            .mark_materialized(path, winner.as_ref().map(|l| &l.mod_key));
        Ok(())
    }

    fn queue_restore(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        path: &NormalizedPath,
        display_path: &str,
        restore: RestorePolicy,
    ) {
        let dst = env.data_path.join(display_path);
        match restore {
            RestorePolicy::FromLedger => {
                if txn.log.has_original(path) && self.backup.contains(path) {
                    txn.queue(FsOp::RestoreOriginal {
                        path: path.clone(),
                        dst,
                        drop_backup: false,
                    });
                }
            }
            RestorePolicy::Restore { drop_backup } => {
                txn.queue(FsOp::RestoreOriginal {
                    path: path.clone(),
                    dst,
                    drop_backup,
                });
            }
        }
    }

    fn queue_create(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        link: &VirtualLink,
        replaces: Replaces,
    ) {
        let norm = link.normalized_path();
        let requirement = self.effective_requirement(env, &norm);
        let dst = env.data_path.join(&link.virtual_path);

        let src = match (&env.mirror_root, requirement) {
            (Some(mirror_root), LinkRequirement::RequireHard) => {
                // Hard links need the source on the game volume
                let mirrored = mirror_root
                    .join(link.mod_key.as_str())
                    .join(&link.virtual_path);
                txn.queue(FsOp::MirrorStage {
                    src: link.real_path.clone(),
                    dst: mirrored.clone(),
                });
                mirrored
            }
            _ => link.real_path.clone(),
        };

        txn.queue(FsOp::CreateLink {
            src,
            dst,
            requirement,
            replaces,
        });
    }

    fn queue_remove(
        &self,
        txn: &mut Transaction<'_>,
        env: &PlanEnv,
        link: &VirtualLink,
        force: bool,
    ) {
        let requirement = self.effective_requirement(env, &link.normalized_path());
        txn.queue(FsOp::RemoveLink {
            dst: env.data_path.join(&link.virtual_path),
            expected_src: link.real_path.clone(),
            force,
            recreate: Some((link.real_path.clone(), requirement)),
        });
    }
}
