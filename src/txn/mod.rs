//! Transaction coordinator
//!
//! Every externally triggered operation runs as one transaction: ledger and
//! overlay mutations go to in-memory shadows, filesystem mutations are
//! journaled as forward ops. Commit is two-phase: the forward ops execute
//! in order (each recording its undo), then the shadows are persisted and
//! promoted. Any failure replays the undo journal in reverse and the live
//! state never changes. Events are buffered and emitted only after a
//! successful commit.

pub(crate) mod ini;

use lockfile::Lockfile;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::time::Instant;

use crate::activator::{self, Overlay};
use crate::backup::BackupStore;
use crate::config::LockPolicy;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::ledger::{self, InstallLog};
use crate::link::{self, LinkRequirement};
use crate::paths::NormalizedPath;

/// The live core state guarded by the process-wide reader-writer lock.
#[derive(Debug, Clone, Default)]
pub struct CoreState {
    pub log: InstallLog,
    pub overlay: Overlay,
}

/// What a new materialization displaces, so its undo can put it back.
#[derive(Debug, Clone)]
pub enum Replaces {
    /// The destination was empty.
    Nothing,
    /// The destination held pristine game content (already captured in the
    /// backup store by an earlier `BackupOriginal` op).
    Original { path: NormalizedPath },
    /// The destination held another mod's materialization.
    Link {
        src: PathBuf,
        requirement: LinkRequirement,
    },
}

/// A journaled forward filesystem mutation.
#[derive(Debug, Clone)]
pub enum FsOp {
    /// Capture pristine game content before it is displaced.
    BackupOriginal {
        path: NormalizedPath,
        source: PathBuf,
    },
    /// Materialize a link at `dst` resolving to `src`.
    CreateLink {
        src: PathBuf,
        dst: PathBuf,
        requirement: LinkRequirement,
        replaces: Replaces,
    },
    /// Remove a materialization. `recreate` carries what the undo should
    /// put back.
    RemoveLink {
        dst: PathBuf,
        expected_src: PathBuf,
        force: bool,
        recreate: Option<(PathBuf, LinkRequirement)>,
    },
    /// Write pristine bytes back into the game directory.
    RestoreOriginal {
        path: NormalizedPath,
        dst: PathBuf,
        /// Also delete the store entry (full uninstall); a plain disable
        /// keeps it for the next enable cycle.
        drop_backup: bool,
    },
    /// Delete a backup whose ledger entry is gone without touching the
    /// game directory (the pristine file never left it).
    DropBackup { path: NormalizedPath },
    /// Copy a staged file onto the game volume so a hard link can succeed.
    MirrorStage { src: PathBuf, dst: PathBuf },
    /// Apply an INI literal (`None` deletes the key).
    WriteIni {
        file: PathBuf,
        section: String,
        key: String,
        value: Option<String>,
        previous: Option<String>,
    },
}

/// Inverse operations, replayed in reverse on abort.
#[derive(Debug)]
enum UndoOp {
    RemoveEntry {
        dst: PathBuf,
    },
    RestoreFromBackup {
        path: NormalizedPath,
        dst: PathBuf,
    },
    RecreateLink {
        src: PathBuf,
        dst: PathBuf,
        requirement: LinkRequirement,
    },
    DropBackup {
        path: NormalizedPath,
    },
    /// Undo a restore: return the bytes to the store and clear `from`.
    ReBackup {
        path: NormalizedPath,
        from: PathBuf,
    },
    /// Undo a backup drop: write the saved bytes back into the store.
    WriteBackup {
        path: NormalizedPath,
        bytes: Vec<u8>,
    },
    RewriteIni {
        file: PathBuf,
        section: String,
        key: String,
        value: Option<String>,
    },
}

/// Everything a transaction needs besides the state lock.
#[derive(Debug, Clone)]
pub struct TxnContext {
    pub lock_path: PathBuf,
    pub lock_policy: LockPolicy,
    pub lock_timeout: Duration,
    pub log_path: PathBuf,
    pub overlay_path: PathBuf,
    pub backup: BackupStore,
}

/// An open transaction: shadows of the core state plus the forward journal.
/// Holds the process-wide write lock and the cross-process advisory lock
/// until commit or rollback.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub log: InstallLog,
    pub overlay: Overlay,
    ops: Vec<FsOp>,
    events: Vec<CoreEvent>,
    guard: RwLockWriteGuard<'a, CoreState>,
    _ledger_lock: Lockfile,
    ctx: TxnContext,
}

impl<'a> Transaction<'a> {
    /// Open a transaction: take the writer lock, the advisory ledger lock,
    /// and shadow the live state.
    pub async fn begin(state: &'a RwLock<CoreState>, ctx: TxnContext) -> Result<Transaction<'a>> {
        let guard = state.write().await;
        let ledger_lock =
            acquire_ledger_lock(&ctx.lock_path, ctx.lock_policy, ctx.lock_timeout).await?;
        Ok(Transaction {
            log: guard.log.clone(),
            overlay: guard.overlay.clone(),
            ops: Vec::new(),
            events: Vec::new(),
            guard,
            _ledger_lock: ledger_lock,
            ctx,
        })
    }

    pub fn queue(&mut self, op: FsOp) {
        self.ops.push(op);
    }

    pub fn queue_event(&mut self, event: CoreEvent) {
        self.events.push(event);
    }

    /// Discard the transaction. Nothing has touched the filesystem or the
    /// live state, so this simply drops the shadows and releases locks.
    pub fn rollback(self) {
        tracing::debug!("transaction rolled back, {} queued ops discarded", self.ops.len());
    }

    /// Two-phase commit: execute the forward journal, persist the shadows,
    /// promote them, then emit buffered events.
    pub async fn commit(mut self, events: &EventBus) -> Result<()> {
        let mut undo_stack: Vec<UndoOp> = Vec::new();

        for op in std::mem::take(&mut self.ops) {
            match execute(&op, &self.ctx.backup).await {
                Ok(mut undo) => undo_stack.append(&mut undo),
                Err(e) => {
                    tracing::warn!("transaction op failed ({e}), replaying undo journal");
                    replay_undo(undo_stack, &self.ctx.backup).await;
                    return Err(e.into_abort());
                }
            }
        }

        if let Err(e) = ledger::document::save(&self.log, &self.ctx.log_path).await {
            replay_undo(undo_stack, &self.ctx.backup).await;
            return Err(e.into_abort());
        }
        if let Err(e) = activator::document::save(&self.overlay, &self.ctx.overlay_path).await {
            unwind_ledger_save(&self.ctx.log_path).await;
            replay_undo(undo_stack, &self.ctx.backup).await;
            return Err(e.into_abort());
        }

        *self.guard = CoreState {
            log: std::mem::take(&mut self.log),
            overlay: std::mem::take(&mut self.overlay),
        };

        for event in self.events.drain(..) {
            events.emit(event);
        }
        Ok(())
    }
}

async fn acquire_ledger_lock(
    path: &Path,
    policy: LockPolicy,
    timeout: Duration,
) -> Result<Lockfile> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let deadline = Instant::now() + timeout;
    loop {
        match Lockfile::create(path) {
            Ok(lock) => return Ok(lock),
            Err(lockfile::Error::LockTaken) => match policy {
                LockPolicy::FailFast => return Err(Error::LedgerLocked),
                LockPolicy::Block => {
                    if Instant::now() >= deadline {
                        return Err(Error::LedgerLocked);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Err(e) => return Err(Error::LedgerIo(format!("ledger lock: {e}"))),
        }
    }
}

async fn execute(op: &FsOp, backup: &BackupStore) -> Result<Vec<UndoOp>> {
    match op {
        FsOp::BackupOriginal { path, source } => {
            if backup.contains(path) {
                return Ok(Vec::new());
            }
            backup.store(path, source).await?;
            Ok(vec![UndoOp::DropBackup { path: path.clone() }])
        }

        FsOp::CreateLink {
            src,
            dst,
            requirement,
            replaces,
        } => {
            link::create_link(src, dst, *requirement)?;
            let undo = match replaces {
                Replaces::Nothing => UndoOp::RemoveEntry { dst: dst.clone() },
                Replaces::Original { path } => UndoOp::RestoreFromBackup {
                    path: path.clone(),
                    dst: dst.clone(),
                },
                Replaces::Link { src, requirement } => UndoOp::RecreateLink {
                    src: src.clone(),
                    dst: dst.clone(),
                    requirement: *requirement,
                },
            };
            Ok(vec![undo])
        }

        FsOp::RemoveLink {
            dst,
            expected_src,
            force,
            recreate,
        } => {
            link::remove_link(dst, expected_src, *force)?;
            Ok(recreate
                .as_ref()
                .map(|(src, requirement)| UndoOp::RecreateLink {
                    src: src.clone(),
                    dst: dst.clone(),
                    requirement: *requirement,
                })
                .into_iter()
                .collect())
        }

        FsOp::RestoreOriginal {
            path,
            dst,
            drop_backup,
        } => {
            backup.restore(path, dst).await?;
            if *drop_backup {
                backup.remove(path).await?;
            }
            Ok(vec![UndoOp::ReBackup {
                path: path.clone(),
                from: dst.clone(),
            }])
        }

        FsOp::DropBackup { path } => {
            let entry = backup.entry_path(path);
            let bytes = match tokio::fs::read(&entry).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(Error::LedgerIo(format!("read backup {path} failed: {e}"))),
            };
            backup.remove(path).await?;
            Ok(vec![UndoOp::WriteBackup {
                path: path.clone(),
                bytes,
            }])
        }

        FsOp::MirrorStage { src, dst } => {
            if !src.exists() {
                return Err(Error::StagingCorrupt(src.clone()));
            }
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(src, dst).await?;
            tracing::debug!("mirrored {} onto game volume", src.display());
            Ok(vec![UndoOp::RemoveEntry { dst: dst.clone() }])
        }

        FsOp::WriteIni {
            file,
            section,
            key,
            value,
            previous,
        } => {
            ini::write_value(file, section, key, value.as_deref())?;
            Ok(vec![UndoOp::RewriteIni {
                file: file.clone(),
                section: section.clone(),
                key: key.clone(),
                value: previous.clone(),
            }])
        }
    }
}

/// Replay undo records newest-first. Undo is best-effort: a failure is
/// logged and the remaining records still replay.
async fn replay_undo(mut undo_stack: Vec<UndoOp>, backup: &BackupStore) {
    while let Some(undo) = undo_stack.pop() {
        let result: Result<()> = match &undo {
            UndoOp::RemoveEntry { dst } => tokio::fs::remove_file(dst)
                .await
                .map_err(Error::from),
            UndoOp::RestoreFromBackup { path, dst } => backup.restore(path, dst).await,
            UndoOp::RecreateLink {
                src,
                dst,
                requirement,
            } => link::create_link(src, dst, *requirement).map(|_| ()),
            UndoOp::DropBackup { path } => backup.remove(path).await,
            UndoOp::ReBackup { path, from } => {
                let entry = backup.entry_path(path);
                let copy_back = async {
                    if let Some(parent) = entry.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(from, &entry).await?;
                    tokio::fs::remove_file(from).await?;
                    Ok::<_, std::io::Error>(())
                };
                copy_back.await.map_err(Error::from)
            }
            UndoOp::WriteBackup { path, bytes } => {
                let entry = backup.entry_path(path);
                let write = async {
                    if let Some(parent) = entry.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&entry, bytes).await
                };
                write.await.map_err(Error::from)
            }
            UndoOp::RewriteIni {
                file,
                section,
                key,
                value,
            } => ini::write_value(file, section, key, value.as_deref()),
        };

        if let Err(e) = result {
            tracing::error!("undo replay failed for {undo:?}: {e}");
        }
    }
}

/// Back out a ledger document save whose sibling overlay save failed.
async fn unwind_ledger_save(log_path: &Path) {
    let bak = ledger::document::bak_path(log_path);
    let result = if tokio::fs::try_exists(&bak).await.unwrap_or(false) {
        tokio::fs::rename(&bak, log_path).await
    } else {
        tokio::fs::remove_file(log_path).await
    };
    if let Err(e) = result {
        tracing::error!("failed to unwind ledger save: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> TxnContext {
        TxnContext {
            lock_path: dir.path().join("InstallLog.lock"),
            lock_policy: LockPolicy::FailFast,
            lock_timeout: Duration::from_secs(1),
            log_path: dir.path().join("InstallLog.xml"),
            overlay_path: dir.path().join("VirtualModConfig.xml"),
            backup: BackupStore::new(dir.path().join("backups")),
        }
    }

    #[tokio::test]
    async fn commit_executes_ops_and_persists_shadows() {
        let dir = TempDir::new().unwrap();
        let state = RwLock::new(CoreState::default());
        let events = EventBus::default();

        let src = dir.path().join("staged.dds");
        tokio::fs::write(&src, b"texture").await.unwrap();
        let dst = dir.path().join("game").join("staged.dds");

        let mut txn = Transaction::begin(&state, ctx(&dir)).await.unwrap();
        txn.queue(FsOp::CreateLink {
            src: src.clone(),
            dst: dst.clone(),
            requirement: LinkRequirement::Any,
            replaces: Replaces::Nothing,
        });
        txn.commit(&events).await.unwrap();

        assert!(dst.exists());
        assert!(dir.path().join("InstallLog.xml").exists());
        assert!(dir.path().join("VirtualModConfig.xml").exists());
        assert!(!dir.path().join("InstallLog.lock").exists());
    }

    #[tokio::test]
    async fn failed_op_unwinds_earlier_ops_and_skips_save() {
        let dir = TempDir::new().unwrap();
        let state = RwLock::new(CoreState::default());
        let events = EventBus::default();
        let mut subscriber = events.subscribe();

        let src = dir.path().join("staged.dds");
        tokio::fs::write(&src, b"texture").await.unwrap();
        let good_dst = dir.path().join("game").join("staged.dds");

        let mut txn = Transaction::begin(&state, ctx(&dir)).await.unwrap();
        txn.queue(FsOp::CreateLink {
            src: src.clone(),
            dst: good_dst.clone(),
            requirement: LinkRequirement::Any,
            replaces: Replaces::Nothing,
        });
        // Second link's source is missing from staging
        txn.queue(FsOp::CreateLink {
            src: dir.path().join("missing.dds"),
            dst: dir.path().join("game").join("missing.dds"),
            requirement: LinkRequirement::Any,
            replaces: Replaces::Nothing,
        });
        txn.queue_event(CoreEvent::LinksPurged);

        let err = txn.commit(&events).await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::StagingCorrupt(_)
        ));

        // First link was unwound, no document written, no event emitted
        assert!(!good_dst.exists());
        assert!(!dir.path().join("InstallLog.xml").exists());
        assert!(subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn rollback_leaves_the_world_untouched() {
        let dir = TempDir::new().unwrap();
        let state = RwLock::new(CoreState::default());

        let mut txn = Transaction::begin(&state, ctx(&dir)).await.unwrap();
        txn.queue(FsOp::CreateLink {
            src: dir.path().join("anything.dds"),
            dst: dir.path().join("game").join("anything.dds"),
            requirement: LinkRequirement::Any,
            replaces: Replaces::Nothing,
        });
        txn.rollback();

        assert!(!dir.path().join("game").exists());
        assert!(!dir.path().join("InstallLog.xml").exists());
        // Lock released; a new transaction can begin
        let txn = Transaction::begin(&state, ctx(&dir)).await.unwrap();
        txn.rollback();
    }

    #[tokio::test]
    async fn second_process_fails_fast_on_a_held_lock() {
        let dir = TempDir::new().unwrap();
        let state = RwLock::new(CoreState::default());
        let other_state = RwLock::new(CoreState::default());

        let txn = Transaction::begin(&state, ctx(&dir)).await.unwrap();
        let contender = Transaction::begin(&other_state, ctx(&dir)).await;
        assert!(matches!(contender.unwrap_err(), Error::LedgerLocked));
        txn.rollback();
    }

    #[tokio::test]
    async fn restore_original_round_trips_through_undo() {
        let dir = TempDir::new().unwrap();
        let backup = BackupStore::new(dir.path().join("backups"));
        let path = NormalizedPath::new("textures/sky.dds");

        let original = dir.path().join("original.dds");
        tokio::fs::write(&original, b"pristine").await.unwrap();
        backup.store(&path, &original).await.unwrap();

        let dst = dir.path().join("game").join("sky.dds");
        let undo = execute(
            &FsOp::RestoreOriginal {
                path: path.clone(),
                dst: dst.clone(),
                drop_backup: true,
            },
            &backup,
        )
        .await
        .unwrap();

        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"pristine");
        assert!(!backup.contains(&path));

        replay_undo(undo, &backup).await;
        assert!(!dst.exists());
        assert!(backup.contains(&path));
    }
}
