//! Link primitive
//!
//! Creates the most durable filesystem link the host allows for a single
//! file: symbolic link, then hard link, then byte copy. The caller decides
//! destinations and ownership; this module only touches one entry at a time
//! and keeps no state.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which strategy actually succeeded for a materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    Symbolic,
    Hard,
    Copy,
}

/// Constraint the caller places on link creation. `RequireHard` is passed
/// for file types the game engine dereferences or exclusively locks
/// (plugins and archives on Bethesda titles), where a symlink breaks the
/// game. `ForceCopy` skips linking entirely for callers configured to
/// deploy plain copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkRequirement {
    #[default]
    Any,
    RequireHard,
    ForceCopy,
}

/// Create a link at `dst` resolving to `src`, trying strategies in order of
/// durability. Any existing entry at `dst` is replaced; callers are
/// responsible for backing up pre-existing game content first.
pub fn create_link(src: &Path, dst: &Path, requirement: LinkRequirement) -> Result<LinkKind> {
    if !src.exists() {
        return Err(Error::StagingCorrupt(src.to_path_buf()));
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    // symlink_metadata so a broken symlink still gets replaced
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }

    if requirement == LinkRequirement::Any {
        match make_symlink(src, dst) {
            Ok(()) => {
                tracing::debug!("symlinked {} -> {}", dst.display(), src.display());
                return Ok(LinkKind::Symbolic);
            }
            // Symlink creation needs OS permission (Developer Mode or an
            // elevated token on Windows); only that failure falls through.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!("symlink denied for {}, trying hard link", dst.display());
            }
            Err(e) => {
                return Err(Error::LinkCreationFailed {
                    path: dst.to_path_buf(),
                    reason: format!("symlink failed: {e}"),
                });
            }
        }
    }

    if requirement != LinkRequirement::ForceCopy {
        match fs::hard_link(src, dst) {
            Ok(()) => {
                tracing::debug!("hard-linked {} -> {}", dst.display(), src.display());
                return Ok(LinkKind::Hard);
            }
            // Hard links need src and dst on one volume; a multi-volume
            // caller mirrors the source onto the game volume and retries
            // before ever reaching the copy fallback.
            Err(e) if is_cross_device(&e) || e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!("hard link unavailable for {}: {e}", dst.display());
            }
            Err(e) => {
                return Err(Error::LinkCreationFailed {
                    path: dst.to_path_buf(),
                    reason: format!("hard link failed: {e}"),
                });
            }
        }
    }

    fs::copy(src, dst).map_err(|e| Error::LinkCreationFailed {
        path: dst.to_path_buf(),
        reason: format!("copy failed: {e}"),
    })?;
    tracing::debug!("copied {} -> {}", dst.display(), src.display());
    Ok(LinkKind::Copy)
}

/// Remove the materialization at `dst` regardless of kind.
///
/// A regular file whose bytes differ from the staged source is user data,
/// not ours; deleting it requires `force` (the user accepting data loss).
/// A missing entry is not an error, so interrupted removals can be retried.
pub fn remove_link(dst: &Path, expected_src: &Path, force: bool) -> Result<()> {
    let metadata = match fs::symlink_metadata(dst) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::LinkRemovalFailed {
                path: dst.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    if metadata.file_type().is_file() && !force {
        let matches = files_identical(dst, expected_src).unwrap_or(false);
        if !matches {
            return Err(Error::LinkRemovalFailed {
                path: dst.to_path_buf(),
                reason: "file content differs from the staged copy".into(),
            });
        }
    }

    fs::remove_file(dst).map_err(|e| Error::LinkRemovalFailed {
        path: dst.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Best link kind the host currently supports inside `dir`. Invoked once at
/// startup to surface capability warnings.
pub fn probe(dir: &Path) -> LinkKind {
    let source = dir.join(".modlink-probe-src");
    let target = dir.join(".modlink-probe-dst");
    let _ = fs::remove_file(&source);
    let _ = fs::remove_file(&target);

    if fs::write(&source, b"probe").is_err() {
        return LinkKind::Copy;
    }

    let kind = if make_symlink(&source, &target).is_ok() {
        LinkKind::Symbolic
    } else if fs::hard_link(&source, &target).is_ok() {
        LinkKind::Hard
    } else {
        LinkKind::Copy
    };

    let _ = fs::remove_file(&target);
    let _ = fs::remove_file(&source);
    kind
}

/// Byte-compare two files, cheap size check first.
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    if ma.len() != mb.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}

#[cfg(unix)]
fn make_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn make_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV on unix, ERROR_NOT_SAME_DEVICE on windows
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(18)
    }
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn create_link_prefers_symlink() {
        let dir = TempDir::new().unwrap();
        let src = staged_file(&dir, "src.dds", b"texture");
        let dst = dir.path().join("game").join("src.dds");

        let kind = create_link(&src, &dst, LinkRequirement::Any).unwrap();
        assert_eq!(kind, LinkKind::Symbolic);
        assert_eq!(fs::read(&dst).unwrap(), b"texture");
    }

    #[test]
    fn require_hard_skips_symlink() {
        let dir = TempDir::new().unwrap();
        let src = staged_file(&dir, "mod.esp", b"plugin");
        let dst = dir.path().join("mod-linked.esp");

        let kind = create_link(&src, &dst, LinkRequirement::RequireHard).unwrap();
        assert_eq!(kind, LinkKind::Hard);
        assert!(!fs::symlink_metadata(&dst).unwrap().file_type().is_symlink());
    }

    #[test]
    fn force_copy_never_links() {
        let dir = TempDir::new().unwrap();
        let src = staged_file(&dir, "src.dds", b"texture");
        let dst = dir.path().join("copied.dds");

        let kind = create_link(&src, &dst, LinkRequirement::ForceCopy).unwrap();
        assert_eq!(kind, LinkKind::Copy);
        assert!(!fs::symlink_metadata(&dst).unwrap().file_type().is_symlink());
        // Writing to the copy must not touch the staged source
        fs::write(&dst, b"changed").unwrap();
        assert_eq!(fs::read(&src).unwrap(), b"texture");
    }

    #[test]
    fn create_link_replaces_existing_entry() {
        let dir = TempDir::new().unwrap();
        let src = staged_file(&dir, "src.dds", b"new");
        let dst = staged_file(&dir, "dst.dds", b"old");

        create_link(&src, &dst, LinkRequirement::Any).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn missing_source_is_staging_corruption() {
        let dir = TempDir::new().unwrap();
        let err = create_link(
            &dir.path().join("gone.dds"),
            &dir.path().join("dst.dds"),
            LinkRequirement::Any,
        )
        .unwrap_err();
        assert!(matches!(err, Error::StagingCorrupt(_)));
    }

    #[test]
    fn remove_link_refuses_modified_regular_file() {
        let dir = TempDir::new().unwrap();
        let src = staged_file(&dir, "src.esp", b"plugin");
        let dst = dir.path().join("dst.esp");
        create_link(&src, &dst, LinkRequirement::RequireHard).unwrap();

        // Simulate in-place user edits breaking the hard link
        fs::remove_file(&dst).unwrap();
        fs::write(&dst, b"user edited").unwrap();

        assert!(matches!(
            remove_link(&dst, &src, false),
            Err(Error::LinkRemovalFailed { .. })
        ));
        remove_link(&dst, &src, true).unwrap();
        assert!(!dst.exists());
    }

    #[test]
    fn remove_link_is_idempotent() {
        let dir = TempDir::new().unwrap();
        remove_link(&dir.path().join("never-there.dds"), Path::new("x"), false).unwrap();
    }

    #[test]
    fn probe_reports_symlink_support() {
        let dir = TempDir::new().unwrap();
        assert_eq!(probe(dir.path()), LinkKind::Symbolic);
    }
}
