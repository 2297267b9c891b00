//! # Directory Store
//!
//! An [`ImplementationStore`] backed by a single root directory. Each
//! immediate child is either a slot named by a digest id (`sha256=...`,
//! `sha256new_...`) or a staging directory with a random name.
//!
//! ## Promotion Protocol
//!
//! 1. Content is staged in a randomly named sibling of the slots.
//! 2. A manifest of the staging directory is generated, saved as
//!    `.manifest`, and its digest compared with the expected one.
//! 3. Under a process-local lock, the store re-checks that no slot exists.
//! 4. The staging directory is renamed to its slot name. A rename that fails
//!    because the destination exists is reported as `AlreadyPresent`, which
//!    covers races with other processes sharing the root.
//! 5. The slot is write-protected, best-effort.
//!
//! Removal renames the slot to a random sibling before deleting it, so no
//! partially deleted tree is ever visible under a digest name.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zstore_core::fsutil::random_name;
use zstore_core::{
    check_cancelled, check_time_accuracy, DigestMismatch, DigestSet, Manifest, ManifestFormat, ManifestNode,
    ProgressSink, StoreError, MANIFEST_FILE,
};

use crate::copy::copy_directory;
use crate::layer::StagingLayer;
use crate::protect::{protect_best_effort, unprotect_best_effort, unprotect_dirs_best_effort};
use crate::store::{ImplementationStore, OptimiseSummary, StoreKind};

/// Options for [`DirectoryStore::open_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Make promoted slots read-only.
    pub write_protection: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            write_protection: true,
        }
    }
}

/// A store rooted at one directory.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    kind: StoreKind,
    options: StoreOptions,
    promote_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Open (creating if needed) the store at `root` with default options.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(root, StoreOptions::default())
    }

    /// Open the store at `root`.
    ///
    /// The root is created if missing and probed for timestamp accuracy.
    /// If the probe is refused for lack of permission the store opens
    /// read-only; an inaccurate filesystem is an error.
    pub fn open_with(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let root = root.into();
        let kind = match fs::create_dir_all(&root) {
            Ok(()) => match check_time_accuracy(&root) {
                Ok(()) => StoreKind::ReadWrite,
                Err(StoreError::FileSystem { source, .. }) if is_read_only_error(&source) => StoreKind::ReadOnly,
                Err(e) => return Err(e),
            },
            Err(e) if is_read_only_error(&e) => StoreKind::ReadOnly,
            Err(e) => return Err(StoreError::fs("failed to create store root", &root, e)),
        };
        let root = fs::canonicalize(&root).unwrap_or(root);
        debug!(path = %root.display(), %kind, "opened implementation store");
        Ok(Self {
            root,
            kind,
            options,
            promote_lock: Mutex::new(()),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        match self.kind {
            StoreKind::ReadWrite => Ok(()),
            StoreKind::ReadOnly => Err(StoreError::ReadOnly {
                path: self.root.clone(),
            }),
        }
    }

    fn create_staging(&self) -> Result<PathBuf, StoreError> {
        loop {
            let path = self.root.join(random_name());
            match fs::create_dir(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "created staging directory");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::fs("failed to create staging directory", &path, e)),
            }
        }
    }

    /// Stage with `fill`, then verify and promote. The staging directory is
    /// removed on every exit path that leaves it behind.
    fn add_staged(
        &self,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
        fill: impl FnOnce(&Path) -> Result<(), StoreError>,
    ) -> Result<PathBuf, StoreError> {
        self.ensure_writable()?;
        if self.contains(expected) {
            return Err(StoreError::AlreadyPresent {
                digest: expected.best_id(),
            });
        }
        let staging = self.create_staging()?;
        let result = fill(&staging).and_then(|()| self.verify_and_promote(&staging, expected, progress));
        if staging.exists() {
            discard(&staging);
        }
        result
    }

    fn verify_and_promote(
        &self,
        staging: &Path,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError> {
        let (format, _) = expected.best();
        let expected_id = expected.best_id();

        let manifest = Manifest::for_directory(staging, format, progress)?;
        let actual_id = manifest.save(&staging.join(MANIFEST_FILE))?;
        if actual_id != expected_id {
            return Err(DigestMismatch {
                expected: expected_id,
                actual: actual_id,
                expected_manifest: None,
                actual_manifest: manifest,
            }
            .into());
        }
        check_cancelled(progress)?;

        let slot = self.root.join(&expected_id);
        {
            let _guard = self.promote_lock.lock();
            if self.contains(expected) {
                return Err(StoreError::AlreadyPresent { digest: expected_id });
            }
            if let Err(e) = fs::rename(staging, &slot) {
                return Err(match e.kind() {
                    io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty => {
                        StoreError::AlreadyPresent { digest: expected_id }
                    }
                    _ => StoreError::fs("failed to promote staging directory to", &slot, e),
                });
            }
        }
        info!(digest = %expected_id, "added implementation");

        if self.options.write_protection {
            protect_best_effort(&slot);
        }
        Ok(slot)
    }

    fn slot_entries(&self) -> Result<Vec<(String, PathBuf, bool)>, StoreError> {
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::fs("failed to list", &self.root, e)),
        };
        let mut out = Vec::new();
        for item in read {
            let item = item.map_err(StoreError::fs_at("failed to list", &self.root))?;
            let is_dir = item.file_type().map(|t| t.is_dir()).unwrap_or(false);
            out.push((item.file_name().to_string_lossy().into_owned(), item.path(), is_dir));
        }
        out.sort();
        Ok(out)
    }

    fn optimise_slot(
        &self,
        slot: &Path,
        format: ManifestFormat,
        seen: &mut HashMap<FileKey, PathBuf>,
    ) -> Result<OptimiseSummary, StoreError> {
        let manifest = Manifest::load(&slot.join(MANIFEST_FILE), format)?;
        let mut summary = OptimiseSummary::default();
        let mut unprotected = false;
        for (rel, node) in manifest.entries() {
            let (hash, mtime, size, executable) = match node {
                ManifestNode::File { hash, mtime, size, .. } => (hash, *mtime, *size, false),
                ManifestNode::ExecutableFile { hash, mtime, size, .. } => (hash, *mtime, *size, true),
                _ => continue,
            };
            let path = rel.split('/').fold(slot.to_path_buf(), |p, part| p.join(part));
            let key = FileKey {
                format,
                hash: hash.clone(),
                mtime,
                size,
                executable,
            };
            let Some(original) = seen.get(&key) else {
                seen.insert(key, path);
                continue;
            };
            if same_file(original, &path) {
                continue;
            }
            if !unprotected && self.options.write_protection {
                unprotect_best_effort(slot);
                unprotected = true;
            }
            let temp = path.with_file_name(format!(".{}.link", random_name()));
            fs::hard_link(original, &temp).map_err(StoreError::fs_at("failed to link", &temp))?;
            if let Err(e) = fs::rename(&temp, &path) {
                let _ = fs::remove_file(&temp);
                return Err(StoreError::fs("failed to replace", &path, e));
            }
            summary.files_linked += 1;
            summary.bytes_saved += size;
        }
        if unprotected {
            protect_best_effort(slot);
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    format: ManifestFormat,
    hash: String,
    mtime: i64,
    size: u64,
    executable: bool,
}

impl ImplementationStore for DirectoryStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn root_paths(&self) -> Vec<PathBuf> {
        vec![self.root.clone()]
    }

    fn contains(&self, digest: &DigestSet) -> bool {
        self.path_for(digest).is_some()
    }

    fn path_for(&self, digest: &DigestSet) -> Option<PathBuf> {
        digest
            .available_ids()
            .into_iter()
            .map(|id| self.root.join(id))
            .find(|path| path.is_dir())
    }

    fn list_all(&self) -> Result<Vec<DigestSet>, StoreError> {
        Ok(self
            .slot_entries()?
            .into_iter()
            .filter(|(_, _, is_dir)| *is_dir)
            .filter_map(|(name, _, _)| DigestSet::parse_slot_name(&name))
            .collect())
    }

    fn list_staging(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(self
            .slot_entries()?
            .into_iter()
            .filter(|(name, _, is_dir)| !*is_dir || DigestSet::parse_slot_name(name).is_none())
            .map(|(_, path, _)| path)
            .collect())
    }

    fn add_from_directory(
        &self,
        source: &Path,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError> {
        self.add_staged(expected, progress, |staging| copy_directory(source, staging, progress))
    }

    fn add_from_streams(
        &self,
        layers: Vec<Box<dyn StagingLayer>>,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError> {
        self.add_staged(expected, progress, |staging| {
            for layer in layers {
                check_cancelled(progress)?;
                layer.apply(staging, progress)?;
            }
            Ok(())
        })
    }

    fn remove(&self, digest: &DigestSet) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let slot = self.path_for(digest).ok_or_else(|| StoreError::NotFound {
            digest: digest.best_id(),
        })?;
        let trash = self.root.join(random_name());
        if let Err(e) = fs::rename(&slot, &trash) {
            // Another remover got there first.
            return Err(match e.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound {
                    digest: digest.best_id(),
                },
                _ => StoreError::fs("failed to move aside", &slot, e),
            });
        }
        // Files may be hard-linked into other slots; only their directories need write access.
        unprotect_dirs_best_effort(&trash);
        fs::remove_dir_all(&trash).map_err(StoreError::fs_at("failed to delete", &trash))?;
        info!(digest = %digest.best_id(), "removed implementation");
        Ok(())
    }

    fn verify(&self, digest: &DigestSet, progress: &dyn ProgressSink) -> Result<Manifest, StoreError> {
        let slot = self.path_for(digest).ok_or_else(|| StoreError::NotFound {
            digest: digest.best_id(),
        })?;
        let result = verify_directory(&slot, progress);
        if self.kind == StoreKind::ReadWrite && self.options.write_protection {
            protect_best_effort(&slot);
        }
        result
    }

    fn audit<'a>(&'a self, progress: &'a dyn ProgressSink) -> Box<dyn Iterator<Item = DigestMismatch> + 'a> {
        let pending = match self.list_all() {
            Ok(all) => all,
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "failed to list store for audit");
                Vec::new()
            }
        };
        Box::new(Audit {
            store: self,
            total: pending.len() as u64,
            pending: pending.into_iter(),
            progress,
            checked: 0,
        })
    }

    fn optimise(&self, progress: &dyn ProgressSink) -> Result<OptimiseSummary, StoreError> {
        self.ensure_writable()?;
        let slots = self.list_all()?;
        let total = slots.len() as u64;
        let mut seen = HashMap::new();
        let mut summary = OptimiseSummary::default();
        for (i, digest) in slots.iter().enumerate() {
            check_cancelled(progress)?;
            progress.report("optimising", i as u64, Some(total));
            let (format, _) = digest.best();
            // Old-format manifests do not record which directory a file sits in.
            if format.uses_old_ordering() {
                continue;
            }
            let slot = self.root.join(digest.best_id());
            match self.optimise_slot(&slot, format, &mut seen) {
                Ok(s) => summary += s,
                Err(e @ StoreError::Cancelled) => return Err(e),
                Err(e) => warn!(digest = %digest.best_id(), error = %e, "skipping slot during optimise"),
            }
        }
        info!(
            files_linked = summary.files_linked,
            bytes_saved = summary.bytes_saved,
            "optimised implementation store"
        );
        Ok(summary)
    }

    fn purge_staging(&self, path: &Path) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let is_child = path.parent() == Some(self.root.as_path());
        let is_slot = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(DigestSet::parse_slot_name)
            .is_some()
            && path.is_dir();
        if !is_child || is_slot {
            return Err(StoreError::InvalidPath(path.display().to_string()));
        }
        let meta = fs::symlink_metadata(path).map_err(StoreError::fs_at("failed to inspect", path))?;
        if meta.is_dir() {
            unprotect_best_effort(path);
            fs::remove_dir_all(path).map_err(StoreError::fs_at("failed to delete", path))?;
        } else {
            fs::remove_file(path).map_err(StoreError::fs_at("failed to delete", path))?;
        }
        info!(path = %path.display(), "purged staging entry");
        Ok(())
    }
}

/// Check that `dir`'s contents match the digest encoded in its own name.
pub fn verify_directory(dir: &Path, progress: &dyn ProgressSink) -> Result<Manifest, StoreError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidDigest(dir.display().to_string()))?;
    let expected = DigestSet::from_id(name)?;
    let (format, _) = expected.best();
    let expected_id = expected.best_id();

    let manifest = Manifest::for_directory(dir, format, progress)?;
    let actual_id = manifest.digest_id();
    if actual_id == expected_id {
        return Ok(manifest);
    }
    let expected_manifest = match Manifest::load(&dir.join(MANIFEST_FILE), format) {
        Ok(m) => Some(m),
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "no usable saved manifest");
            None
        }
    };
    Err(DigestMismatch {
        expected: expected_id,
        actual: actual_id,
        expected_manifest,
        actual_manifest: manifest,
    }
    .into())
}

struct Audit<'a> {
    store: &'a DirectoryStore,
    pending: std::vec::IntoIter<DigestSet>,
    progress: &'a dyn ProgressSink,
    checked: u64,
    total: u64,
}

impl Iterator for Audit<'_> {
    type Item = DigestMismatch;

    fn next(&mut self) -> Option<DigestMismatch> {
        for digest in self.pending.by_ref() {
            self.progress.report("auditing", self.checked, Some(self.total));
            self.checked += 1;
            match self.store.verify(&digest, self.progress) {
                Ok(_) => {}
                Err(StoreError::DigestMismatch(mismatch)) => {
                    warn!(
                        expected = %mismatch.expected,
                        actual = %mismatch.actual,
                        "implementation is damaged"
                    );
                    return Some(*mismatch);
                }
                Err(StoreError::Cancelled) => {
                    self.pending = Vec::new().into_iter();
                    return None;
                }
                Err(e) => warn!(digest = %digest.best_id(), error = %e, "failed to audit implementation"),
            }
        }
        None
    }
}

/// Remove a staging directory, logging on failure.
fn discard(staging: &Path) {
    unprotect_best_effort(staging);
    match fs::remove_dir_all(staging) {
        Ok(()) => debug!(path = %staging.display(), "removed staging directory"),
        Err(e) => warn!(path = %staging.display(), error = %e, "failed to remove staging directory"),
    }
}

fn is_read_only_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}
