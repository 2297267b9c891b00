//! Recursive directory copy into a staging area.
//!
//! The copy preserves everything a manifest depends on: file contents,
//! modification times (whole seconds), executable bits and symlinks. On
//! platforms without native symlinks the link target is written as a file
//! and recorded in the staging root's `.symlink` sidecar.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zstore_core::flags::{self, FlagKind};
use zstore_core::{check_cancelled, ProgressSink, StoreError};

/// Copy the contents of `src` into the existing directory `dest`.
///
/// Flag records that apply to `src` but live in a sidecar above it are
/// carried over into `dest`'s own sidecars, rebased onto `dest`.
pub fn copy_directory(src: &Path, dest: &Path, progress: &dyn ProgressSink) -> Result<(), StoreError> {
    let src = fs::canonicalize(src).map_err(StoreError::fs_at("failed to resolve", src))?;
    if !src.is_dir() {
        return Err(StoreError::fs(
            "not a directory:",
            &src,
            io::Error::new(io::ErrorKind::NotFound, "source is not a directory"),
        ));
    }

    let mut directories: Vec<(PathBuf, fs::Metadata)> = Vec::new();
    let mut copied: u64 = 0;
    for entry in WalkDir::new(&src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(&src, e))?;
        check_cancelled(progress)?;
        let rel = entry
            .path()
            .strip_prefix(&src)
            .map_err(|_| StoreError::InvalidPath(entry.path().display().to_string()))?;
        let target = dest.join(rel);
        let meta = fs::symlink_metadata(entry.path()).map_err(StoreError::fs_at("failed to inspect", entry.path()))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(StoreError::fs_at("failed to create", &target))?;
            directories.push((target, meta));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target, dest, rel)?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &target, &meta)?;
            copied += meta.len();
            progress.report("copying", copied, None);
        } else {
            return Err(StoreError::UnsupportedEntry {
                path: entry.path().to_path_buf(),
            });
        }
    }

    // Children are done, so directory timestamps will not be disturbed again.
    for (dir, meta) in directories.iter().rev() {
        if let Ok(mtime) = meta.modified() {
            if let Err(e) = File::open(dir).and_then(|f| f.set_modified(mtime)) {
                tracing::debug!(path = %dir.display(), error = %e, "could not preserve directory mtime");
            }
        }
    }

    carry_ancestor_flags(&src, dest)
}

fn walk_error(root: &Path, e: walkdir::Error) -> StoreError {
    let path = e.path().unwrap_or(root).to_path_buf();
    StoreError::FileSystem {
        context: "failed to walk",
        path,
        source: io::Error::from(e),
    }
}

fn copy_file(src: &Path, target: &Path, meta: &fs::Metadata) -> Result<(), StoreError> {
    let mut reader = File::open(src).map_err(StoreError::fs_at("failed to open", src))?;
    let mut writer = File::create(target).map_err(StoreError::fs_at("failed to create", target))?;
    io::copy(&mut reader, &mut writer).map_err(StoreError::fs_at("failed to copy to", target))?;
    let mtime = meta.modified().map_err(StoreError::fs_at("failed to read modification time of", src))?;
    writer.set_modified(mtime).map_err(|e| match e.kind() {
        io::ErrorKind::Unsupported => StoreError::UnstableTimestamp {
            path: target.to_path_buf(),
        },
        _ => StoreError::fs("failed to set modification time of", target, e),
    })?;
    drop(writer);
    copy_exec_bits(meta, target)
}

#[cfg(unix)]
fn copy_exec_bits(meta: &fs::Metadata, target: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    // Staged files stay owner-writable until promotion protects them.
    let mode = (meta.permissions().mode() & 0o777) | 0o200;
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
        .map_err(StoreError::fs_at("failed to set permissions of", target))
}

#[cfg(not(unix))]
fn copy_exec_bits(_meta: &fs::Metadata, _target: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path, _dest: &Path, _rel: &Path) -> Result<(), StoreError> {
    let link = fs::read_link(src).map_err(StoreError::fs_at("failed to read link", src))?;
    std::os::unix::fs::symlink(&link, target).map_err(StoreError::fs_at("failed to create link", target))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path, dest: &Path, rel: &Path) -> Result<(), StoreError> {
    let link = fs::read_link(src).map_err(StoreError::fs_at("failed to read link", src))?;
    let text = link.to_string_lossy().replace('\\', "/");
    fs::write(target, text).map_err(StoreError::fs_at("failed to write", target))?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    flags::set_flag(&dest.join(FlagKind::Symlink.file_name()), &rel)
}

/// Rebase records from a sidecar found above `src` into `dest`'s sidecars.
fn carry_ancestor_flags(src: &Path, dest: &Path) -> Result<(), StoreError> {
    for kind in [FlagKind::Executable, FlagKind::Symlink] {
        let set = flags::read_flags(kind, src)?;
        let Some(base) = set.base() else {
            continue;
        };
        if base == src {
            continue;
        }
        let Ok(offset) = src.strip_prefix(base) else {
            continue;
        };
        let prefix = format!("/{}/", offset.to_string_lossy().replace('\\', "/"));
        let sidecar = dest.join(kind.file_name());
        for path in set.paths() {
            if let Some(rel) = path.strip_prefix(prefix.as_str()) {
                flags::set_flag(&sidecar, rel)?;
            }
        }
    }
    Ok(())
}
