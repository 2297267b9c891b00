//! # Staging Layers
//!
//! [`add_from_streams`](crate::ImplementationStore::add_from_streams) builds
//! an implementation from several sources applied over each other in order.
//! Each source is a [`StagingLayer`]. Archive decoding is not done here:
//! callers hand in directories they already extracted, or individual byte
//! streams they already authenticated.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use zstore_core::flags::{self, FlagKind};
use zstore_core::{check_cancelled, ProgressSink, StoreError};

use crate::copy::copy_directory;

/// One source of content written into a staging directory.
pub trait StagingLayer: Send + fmt::Debug {
    /// Write this layer's content into `staging`, overwriting earlier layers.
    fn apply(self: Box<Self>, staging: &Path, progress: &dyn ProgressSink) -> Result<(), StoreError>;
}

/// Copies an already-extracted directory (or one of its subdirectories).
#[derive(Debug, Clone)]
pub struct DirectoryLayer {
    source: PathBuf,
    sub_dir: Option<String>,
}

impl DirectoryLayer {
    /// Copy all of `source`.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            sub_dir: None,
        }
    }

    /// Copy only `sub_dir` (a relative, `/`-separated path) of the source.
    pub fn with_sub_dir(mut self, sub_dir: impl Into<String>) -> Self {
        self.sub_dir = Some(sub_dir.into());
        self
    }
}

impl StagingLayer for DirectoryLayer {
    fn apply(self: Box<Self>, staging: &Path, progress: &dyn ProgressSink) -> Result<(), StoreError> {
        let source = match &self.sub_dir {
            Some(sub) => self.source.join(safe_relative(sub)?),
            None => self.source.clone(),
        };
        // Later layers win: an overlay copy goes to a scratch dir first, then merges.
        let scratch = staging.join(format!(".layer.{}", zstore_core::fsutil::random_name()));
        fs::create_dir(&scratch).map_err(StoreError::fs_at("failed to create", &scratch))?;
        let result = copy_directory(&source, &scratch, progress).and_then(|()| merge_into(&scratch, staging, true));
        if scratch.exists() {
            let _ = fs::remove_dir_all(&scratch);
        }
        result
    }
}

/// Writes a single file from a byte stream.
pub struct StreamLayer<R> {
    reader: R,
    path: String,
    executable: bool,
    mtime: Option<SystemTime>,
}

impl<R: Read + Send> StreamLayer<R> {
    /// Write the stream's bytes to `path` (relative, `/`-separated).
    pub fn new(reader: R, path: impl Into<String>) -> Self {
        Self {
            reader,
            path: path.into(),
            executable: false,
            mtime: None,
        }
    }

    /// Record the file in the staging root's `.xbit` sidecar.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    /// Set the file's modification time; otherwise the write time is kept.
    pub fn modified(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

impl<R> fmt::Debug for StreamLayer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLayer")
            .field("path", &self.path)
            .field("executable", &self.executable)
            .field("mtime", &self.mtime)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Send> StagingLayer for StreamLayer<R> {
    fn apply(mut self: Box<Self>, staging: &Path, progress: &dyn ProgressSink) -> Result<(), StoreError> {
        check_cancelled(progress)?;
        let rel = safe_relative(&self.path)?;
        let target = staging.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(StoreError::fs_at("failed to create", parent))?;
        }
        let mut file = File::create(&target).map_err(StoreError::fs_at("failed to create", &target))?;
        let written = io::copy(&mut self.reader, &mut file).map_err(StoreError::fs_at("failed to write", &target))?;
        if let Some(mtime) = self.mtime {
            file.set_modified(mtime)
                .map_err(StoreError::fs_at("failed to set modification time of", &target))?;
        }
        progress.report("writing", written, Some(written));
        if self.executable {
            flags::set_flag(&staging.join(FlagKind::Executable.file_name()), &self.path)?;
        }
        Ok(())
    }
}

/// Parse a `/`-separated relative path, refusing anything that escapes its base.
fn safe_relative(path: &str) -> Result<PathBuf, StoreError> {
    let mut out = PathBuf::new();
    for part in path.split(['/', '\\']).filter(|p| !p.is_empty() && *p != ".") {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) => out.push(part),
            _ => return Err(StoreError::InvalidPath(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() || path.starts_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(out)
}

/// Move everything from `from` into `into`, replacing files that already exist.
/// Flag sidecars at the root are merged rather than replaced; deeper down
/// they are ordinary files.
fn merge_into(from: &Path, into: &Path, is_root: bool) -> Result<(), StoreError> {
    for item in fs::read_dir(from).map_err(StoreError::fs_at("failed to list", from))? {
        let item = item.map_err(StoreError::fs_at("failed to list", from))?;
        let name = item.file_name();
        let src = item.path();
        let dest = into.join(&name);
        let src_is_dir = fs::symlink_metadata(&src)
            .map_err(StoreError::fs_at("failed to inspect", &src))?
            .is_dir();
        let dest_meta = fs::symlink_metadata(&dest).ok();

        if is_root && (name == FlagKind::Executable.file_name() || name == FlagKind::Symlink.file_name()) {
            append_records(&src, &dest)?;
            continue;
        }
        match dest_meta {
            Some(meta) if meta.is_dir() && src_is_dir => merge_into(&src, &dest, false)?,
            Some(meta) => {
                if meta.is_dir() {
                    fs::remove_dir_all(&dest).map_err(StoreError::fs_at("failed to replace", &dest))?;
                } else {
                    fs::remove_file(&dest).map_err(StoreError::fs_at("failed to replace", &dest))?;
                }
                fs::rename(&src, &dest).map_err(StoreError::fs_at("failed to move", &src))?;
            }
            None => fs::rename(&src, &dest).map_err(StoreError::fs_at("failed to move", &src))?,
        }
    }
    Ok(())
}

fn append_records(src: &Path, dest: &Path) -> Result<(), StoreError> {
    let text = fs::read_to_string(src).map_err(StoreError::fs_at("failed to read", src))?;
    for line in text.lines().filter_map(|l| l.strip_prefix('/')) {
        flags::set_flag(dest, line)?;
    }
    Ok(())
}
