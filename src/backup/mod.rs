//! Backup store for pristine game content
//!
//! When a mod first claims a path that already exists in the game
//! directory, the original bytes land here so a full uninstall can restore
//! them. Filenames are the SHA-1 of the normalized path; the ledger records
//! the association, never the bytes. The ledger is also the authority on
//! lifetime: a backup must not be deleted while its bottom-of-stack entry
//! still exists.

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Error, Result};
use crate::paths::NormalizedPath;

/// Content store addressed by normalized game path.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backup filename for a normalized path: lower-hex SHA-1.
    pub fn hash_name(path: &NormalizedPath) -> String {
        hex::encode(Sha1::digest(path.as_str().as_bytes()))
    }

    /// On-disk location of the backup for `path`.
    pub fn entry_path(&self, path: &NormalizedPath) -> PathBuf {
        self.root.join(Self::hash_name(path))
    }

    pub fn contains(&self, path: &NormalizedPath) -> bool {
        self.entry_path(path).exists()
    }

    /// Copy the pre-existing game file at `source` into the store.
    /// Overwrites nothing: the first capture for a path wins, later calls
    /// while an entry exists are no-ops.
    pub async fn store(&self, path: &NormalizedPath, source: &Path) -> Result<String> {
        fs::create_dir_all(&self.root).await?;
        let dest = self.entry_path(path);
        if !dest.exists() {
            fs::copy(source, &dest)
                .await
                .map_err(|e| Error::LedgerIo(format!("backup of {path} failed: {e}")))?;
            tracing::debug!("backed up {} as {}", path, Self::hash_name(path));
        }
        Ok(Self::hash_name(path))
    }

    /// Restore the pristine bytes for `path` to `dest`, leaving the backup
    /// in place. The caller removes the store entry once the ledger entry
    /// is gone.
    pub async fn restore(&self, path: &NormalizedPath, dest: &Path) -> Result<()> {
        let entry = self.entry_path(path);
        if !entry.exists() {
            return Err(Error::LedgerIo(format!("no backup recorded for {path}")));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&entry, dest)
            .await
            .map_err(|e| Error::LedgerIo(format!("restore of {path} failed: {e}")))?;
        tracing::debug!("restored original {}", path);
        Ok(())
    }

    /// Drop the stored bytes for `path`. Only legal once the corresponding
    /// ledger entry has been removed.
    pub async fn remove(&self, path: &NormalizedPath) -> Result<()> {
        let entry = self.entry_path(path);
        match fs::remove_file(&entry).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LedgerIo(format!("backup removal of {path} failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn store_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        let original = dir.path().join("skyrim.ini");
        tokio::fs::write(&original, b"[Display]\nfShadowDistance=3000")
            .await
            .unwrap();

        let path = NormalizedPath::new("Skyrim.ini");
        store.store(&path, &original).await.unwrap();
        assert!(store.contains(&path));

        let restored = dir.path().join("restored.ini");
        store.restore(&path, &restored).await.unwrap();
        assert_eq!(
            tokio::fs::read(&restored).await.unwrap(),
            b"[Display]\nfShadowDistance=3000"
        );
    }

    #[tokio::test]
    async fn first_capture_wins() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        let path = NormalizedPath::new("textures/sky.dds");

        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        tokio::fs::write(&v1, b"original").await.unwrap();
        tokio::fs::write(&v2, b"already modded").await.unwrap();

        store.store(&path, &v1).await.unwrap();
        store.store(&path, &v2).await.unwrap();

        let out = dir.path().join("out");
        store.restore(&path, &out).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn names_are_stable_sha1_of_the_normalized_path() {
        let path = NormalizedPath::new("Data/Textures/Sky.DDS");
        let name = BackupStore::hash_name(&path);
        assert_eq!(name.len(), 40);
        assert_eq!(name, BackupStore::hash_name(&NormalizedPath::new("data/textures/sky.dds")));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("backups"));
        store.remove(&NormalizedPath::new("never/there.nif")).await.unwrap();
    }
}
