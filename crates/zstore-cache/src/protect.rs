//! Write protection for promoted slots.
//!
//! On Unix this clears (or restores) the owner/group/other write bits on
//! every file and directory in the tree. Elsewhere it toggles the read-only
//! attribute on files. Symlinks are skipped: changing their mode would
//! change the link target's mode instead.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Make everything under `root` read-only.
pub fn protect(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        set_writable(entry.path(), false)?;
    }
    Ok(())
}

/// Restore write access to everything under `root`.
///
/// Directories are made writable before they are descended into, so a fully
/// protected tree can be unprotected.
pub fn unprotect(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.path_is_symlink() {
            continue;
        }
        set_writable(entry.path(), true)?;
    }
    Ok(())
}

/// Restore write access to the directories under `root`, leaving files alone.
///
/// Enough to delete the tree on Unix, and files hard-linked from other slots
/// stay read-only. Elsewhere read-only files block deletion, so this falls
/// back to [`unprotect`].
pub fn unprotect_dirs(root: &Path) -> io::Result<()> {
    if !cfg!(unix) {
        return unprotect(root);
    }
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            set_writable(entry.path(), true)?;
        }
    }
    Ok(())
}

/// [`protect`], logging instead of failing.
pub fn protect_best_effort(root: &Path) {
    if let Err(e) = protect(root) {
        tracing::warn!(path = %root.display(), error = %e, "failed to write-protect implementation");
    }
}

/// [`unprotect`], logging instead of failing.
pub fn unprotect_best_effort(root: &Path) {
    if let Err(e) = unprotect(root) {
        tracing::warn!(path = %root.display(), error = %e, "failed to remove write protection");
    }
}

/// [`unprotect_dirs`], logging instead of failing.
pub fn unprotect_dirs_best_effort(root: &Path) {
    if let Err(e) = unprotect_dirs(root) {
        tracing::warn!(path = %root.display(), error = %e, "failed to remove write protection");
    }
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::symlink_metadata(path)?.permissions();
    let mode = perms.mode();
    let new_mode = if writable { mode | 0o200 } else { mode & !0o222 };
    if new_mode != mode {
        perms.set_mode(new_mode);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if perms.readonly() == writable {
        perms.set_readonly(!writable);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
