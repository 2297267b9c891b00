//! # Flag Files — External Executable and Symlink Records
//!
//! Filesystems such as FAT or NTFS cannot record the POSIX executable bit or
//! represent symbolic links faithfully. Whoever stages an implementation on
//! such a filesystem records those properties in sidecar files instead:
//!
//! - `.xbit` lists files that are executable.
//! - `.symlink` lists files whose content is a symlink target.
//!
//! Each line is a path relative to the directory holding the sidecar,
//! rooted with `/` and always using forward slashes (e.g. `/bin/tool`).
//! Lines not starting with `/` are ignored.
//!
//! The sidecar for a tree is found by searching upward from the tree's root
//! until one exists or the filesystem root is reached. All functions take an
//! explicit starting directory; nothing depends on the working directory.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::StoreError;
use crate::fsutil::write_atomic;

/// Sidecar listing executable files.
pub const XBIT_FILE: &str = ".xbit";

/// Sidecar listing files to be treated as symlinks.
pub const SYMLINK_FILE: &str = ".symlink";

/// The two properties that can be recorded in sidecar files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    /// The file is executable.
    Executable,
    /// The file's content is the target of a symbolic link.
    Symlink,
}

impl FlagKind {
    /// Name of the sidecar file for this kind.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Executable => XBIT_FILE,
            Self::Symlink => SYMLINK_FILE,
        }
    }
}

/// Paths recorded in one sidecar, anchored at the directory it was found in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet {
    base: Option<PathBuf>,
    paths: BTreeSet<String>,
}

impl FlagSet {
    /// The directory holding the sidecar, or `None` if none was found.
    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    /// `true` if no paths are recorded.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Recorded paths, each rooted with `/`.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// `true` if `path` (absolute, or relative to the working directory in the
    /// same way as the base) is recorded.
    pub fn contains(&self, path: &Path) -> bool {
        let Some(base) = &self.base else {
            return false;
        };
        match path.strip_prefix(base) {
            Ok(rel) => self.paths.contains(&to_unix_rooted(rel)),
            Err(_) => false,
        }
    }
}

/// Search upward from `start_dir` for the sidecar of `kind`.
pub fn find_flag_file(kind: FlagKind, start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(|dir| dir.join(kind.file_name()))
        .find(|candidate| candidate.is_file())
}

/// Read the flags of `kind` that apply to the tree at `target_dir`.
///
/// A missing sidecar yields an empty set.
pub fn read_flags(kind: FlagKind, target_dir: &Path) -> Result<FlagSet, StoreError> {
    let Some(sidecar) = find_flag_file(kind, target_dir) else {
        return Ok(FlagSet::default());
    };
    let text = fs::read_to_string(&sidecar).map_err(StoreError::fs_at("failed to read", &sidecar))?;
    let paths = text
        .lines()
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
        .collect();
    Ok(FlagSet {
        base: sidecar.parent().map(Path::to_path_buf),
        paths,
    })
}

/// Append `relative_path` to the sidecar at `sidecar_path`, creating it if needed.
pub fn set_flag(sidecar_path: &Path, relative_path: &str) -> Result<(), StoreError> {
    let record = normalize_relative(relative_path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(sidecar_path)
        .map_err(StoreError::fs_at("failed to open", sidecar_path))?;
    writeln!(file, "{record}").map_err(StoreError::fs_at("failed to write", sidecar_path))
}

/// Remove `relative_path` and everything nested under it from the sidecar.
pub fn clear_flag(sidecar_path: &Path, relative_path: &str) -> Result<(), StoreError> {
    let record = normalize_relative(relative_path)?;
    let nested = format!("{record}/");
    rewrite(sidecar_path, |line| {
        (line != record && !line.starts_with(&nested)).then(|| line.to_string())
    })
}

/// Rewrite records for `source` (and anything under it) to point at `destination`.
pub fn rename_flag(sidecar_path: &Path, source: &str, destination: &str) -> Result<(), StoreError> {
    let source = normalize_relative(source)?;
    let destination = normalize_relative(destination)?;
    let nested = format!("{source}/");
    rewrite(sidecar_path, |line| {
        if line == source || line.starts_with(&nested) {
            Some(format!("{destination}{}", &line[source.len()..]))
        } else {
            Some(line.to_string())
        }
    })
}

/// Prepend `prefix` to every record, used when a tree is moved under a new
/// parent directory.
pub fn reprefix(sidecar_path: &Path, prefix: &str) -> Result<(), StoreError> {
    let prefix = normalize_relative(prefix)?;
    rewrite(sidecar_path, |line| Some(format!("{prefix}{line}")))
}

/// Atomically rewrite every `/`-rooted line through `map`; other lines are dropped.
fn rewrite(sidecar_path: &Path, mut map: impl FnMut(&str) -> Option<String>) -> Result<(), StoreError> {
    let text = match fs::read_to_string(sidecar_path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::fs("failed to read", sidecar_path, e)),
    };
    let mut out = String::with_capacity(text.len());
    for line in text.lines().filter(|l| l.starts_with('/')) {
        if let Some(new_line) = map(line) {
            out.push_str(&new_line);
            out.push('\n');
        }
    }
    write_atomic(sidecar_path, out.as_bytes())
}

/// Turn a host- or slash-separated relative path into a `/`-rooted record.
fn normalize_relative(relative_path: &str) -> Result<String, StoreError> {
    let unified = relative_path.replace('\\', "/");
    let trimmed = unified.trim_matches('/');
    if trimmed.is_empty() || Path::new(relative_path).is_absolute() || unified.starts_with('/') {
        return Err(StoreError::InvalidPath(relative_path.to_string()));
    }
    if trimmed.split('/').any(|c| c == ".." || c.is_empty()) {
        return Err(StoreError::InvalidPath(relative_path.to_string()));
    }
    Ok(format!("/{trimmed}"))
}

fn to_unix_rooted(rel: &Path) -> String {
    let mut out = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}
