//! The [`ImplementationStore`] trait and the types shared by its implementations.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use zstore_core::{DigestMismatch, DigestSet, Manifest, ProgressSink, StoreError};

use crate::layer::StagingLayer;

/// Whether a store accepts mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Adds, removals and optimisation are allowed.
    ReadWrite,
    /// Only lookups and verification are allowed.
    ReadOnly,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
        })
    }
}

/// Result of an [`ImplementationStore::optimise`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimiseSummary {
    /// Files replaced by hard links to identical files in other slots.
    pub files_linked: u64,
    /// Bytes no longer stored twice.
    pub bytes_saved: u64,
}

impl std::ops::AddAssign for OptimiseSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.files_linked += rhs.files_linked;
        self.bytes_saved += rhs.bytes_saved;
    }
}

/// A content-addressed cache of implementation directories.
///
/// Every slot is named by a digest of its manifest; adding verifies the
/// digest before the slot becomes visible, and a slot is never modified in
/// place once promoted.
pub trait ImplementationStore: Send + Sync + fmt::Debug {
    /// Whether mutations are allowed.
    fn kind(&self) -> StoreKind;

    /// The root directories this store reads from.
    fn root_paths(&self) -> Vec<PathBuf>;

    /// `true` if a slot exists under any encoding of `digest`.
    fn contains(&self, digest: &DigestSet) -> bool;

    /// The first existing slot for `digest`, trying the best encoding first.
    fn path_for(&self, digest: &DigestSet) -> Option<PathBuf>;

    /// Every slot whose name parses as a digest, sorted.
    fn list_all(&self) -> Result<Vec<DigestSet>, StoreError>;

    /// Entries under the root that are not slots: leftovers of interrupted adds.
    fn list_staging(&self) -> Result<Vec<PathBuf>, StoreError>;

    /// Copy `source` into the store if its digest matches `expected`.
    /// Returns the path of the new slot.
    fn add_from_directory(
        &self,
        source: &Path,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError>;

    /// Build an implementation from `layers` applied in order, then add it if
    /// its digest matches `expected`. Returns the path of the new slot.
    fn add_from_streams(
        &self,
        layers: Vec<Box<dyn StagingLayer>>,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError>;

    /// Delete the slot for `digest`. The slot disappears atomically.
    fn remove(&self, digest: &DigestSet) -> Result<(), StoreError>;

    /// Recompute the slot's manifest and check it still matches its name.
    fn verify(&self, digest: &DigestSet, progress: &dyn ProgressSink) -> Result<Manifest, StoreError>;

    /// Verify every slot, yielding only the mismatches. Other failures are
    /// logged and skipped; cancellation ends the sequence.
    fn audit<'a>(&'a self, progress: &'a dyn ProgressSink) -> Box<dyn Iterator<Item = DigestMismatch> + 'a>;

    /// Hard-link identical files across slots.
    fn optimise(&self, progress: &dyn ProgressSink) -> Result<OptimiseSummary, StoreError>;

    /// Delete one entry reported by [`ImplementationStore::list_staging`].
    fn purge_staging(&self, path: &Path) -> Result<(), StoreError>;
}
