//! # Composite Store
//!
//! Presents several [`ImplementationStore`]s, in priority order, as one.
//! Typical setups put a per-user cache first and shared, read-only system
//! caches after it.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zstore_core::{DigestMismatch, DigestSet, Manifest, ProgressSink, StoreError};

use crate::layer::StagingLayer;
use crate::store::{ImplementationStore, OptimiseSummary, StoreKind};

/// An ordered set of stores acting as one.
#[derive(Debug, Default)]
pub struct CompositeStore {
    stores: Vec<Box<dyn ImplementationStore>>,
}

impl CompositeStore {
    /// Combine `stores`; earlier stores take priority.
    pub fn new(stores: Vec<Box<dyn ImplementationStore>>) -> Self {
        Self { stores }
    }

    /// The member stores in priority order.
    pub fn stores(&self) -> &[Box<dyn ImplementationStore>] {
        &self.stores
    }

    fn writable(&self) -> impl Iterator<Item = &dyn ImplementationStore> {
        self.stores
            .iter()
            .map(|s| &**s)
            .filter(|s| s.kind() == StoreKind::ReadWrite)
    }

    fn no_writable_store(&self) -> StoreError {
        StoreError::ReadOnly {
            path: self.root_paths().into_iter().next().unwrap_or_default(),
        }
    }
}

impl ImplementationStore for CompositeStore {
    fn kind(&self) -> StoreKind {
        if self.writable().next().is_some() {
            StoreKind::ReadWrite
        } else {
            StoreKind::ReadOnly
        }
    }

    fn root_paths(&self) -> Vec<PathBuf> {
        self.stores.iter().flat_map(|s| s.root_paths()).collect()
    }

    fn contains(&self, digest: &DigestSet) -> bool {
        self.stores.iter().any(|s| s.contains(digest))
    }

    fn path_for(&self, digest: &DigestSet) -> Option<PathBuf> {
        self.stores.iter().find_map(|s| s.path_for(digest))
    }

    fn list_all(&self) -> Result<Vec<DigestSet>, StoreError> {
        let mut all = Vec::new();
        for store in &self.stores {
            all.extend(store.list_all()?);
        }
        all.sort();
        all.dedup();
        Ok(all)
    }

    fn list_staging(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut all = Vec::new();
        for store in &self.stores {
            all.extend(store.list_staging()?);
        }
        Ok(all)
    }

    fn add_from_directory(
        &self,
        source: &Path,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError> {
        if self.contains(expected) {
            return Err(StoreError::AlreadyPresent {
                digest: expected.best_id(),
            });
        }
        let mut last_error = None;
        for store in self.writable() {
            match store.add_from_directory(source, expected, progress) {
                Ok(path) => return Ok(path),
                Err(e @ (StoreError::AlreadyPresent { .. } | StoreError::DigestMismatch(_) | StoreError::Cancelled)) => {
                    return Err(e)
                }
                Err(e) => {
                    debug!(roots = ?store.root_paths(), error = %e, "store refused implementation, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| self.no_writable_store()))
    }

    fn add_from_streams(
        &self,
        layers: Vec<Box<dyn StagingLayer>>,
        expected: &DigestSet,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf, StoreError> {
        if self.contains(expected) {
            return Err(StoreError::AlreadyPresent {
                digest: expected.best_id(),
            });
        }
        // Layers are consumed by the first attempt, so only one store can be tried.
        match self.writable().next() {
            Some(store) => store.add_from_streams(layers, expected, progress),
            None => Err(self.no_writable_store()),
        }
    }

    fn remove(&self, digest: &DigestSet) -> Result<(), StoreError> {
        let mut removed = false;
        for store in self.stores.iter().filter(|s| s.contains(digest)) {
            store.remove(digest)?;
            removed = true;
        }
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                digest: digest.best_id(),
            })
        }
    }

    fn verify(&self, digest: &DigestSet, progress: &dyn ProgressSink) -> Result<Manifest, StoreError> {
        match self.stores.iter().find(|s| s.contains(digest)) {
            Some(store) => store.verify(digest, progress),
            None => Err(StoreError::NotFound {
                digest: digest.best_id(),
            }),
        }
    }

    fn audit<'a>(&'a self, progress: &'a dyn ProgressSink) -> Box<dyn Iterator<Item = DigestMismatch> + 'a> {
        Box::new(self.stores.iter().flat_map(move |s| s.audit(progress)))
    }

    fn optimise(&self, progress: &dyn ProgressSink) -> Result<OptimiseSummary, StoreError> {
        let mut total = OptimiseSummary::default();
        for store in self.writable() {
            match store.optimise(progress) {
                Ok(summary) => total += summary,
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(e) => warn!(roots = ?store.root_paths(), error = %e, "failed to optimise store"),
            }
        }
        Ok(total)
    }

    fn purge_staging(&self, path: &Path) -> Result<(), StoreError> {
        let owner = self
            .stores
            .iter()
            .find(|s| s.root_paths().iter().any(|root| path.parent() == Some(root.as_path())));
        match owner {
            Some(store) => store.purge_staging(path),
            None => Err(StoreError::InvalidPath(path.display().to_string())),
        }
    }
}
