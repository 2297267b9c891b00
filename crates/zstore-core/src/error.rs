//! # Error Types — Store Error Taxonomy
//!
//! Defines the errors returned by every store, manifest and flag-file
//! operation. All errors use `thiserror` for derive-based `Display` and
//! `Error` implementations.
//!
//! ## Design
//!
//! - `DigestMismatch` is never downgraded or swallowed. It carries both
//!   digests and the manifest that produced the actual one.
//! - Filesystem failures keep the path and the operation that failed.
//! - Best-effort work (write protection) logs instead of returning errors,
//!   so nothing in this enum represents those failures.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::manifest::Manifest;

/// Errors produced by the implementation store and its building blocks.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The expected digest was empty, used no known algorithm, or was malformed.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// An implementation with this digest is already in the store.
    #[error("implementation {digest} is already in the store")]
    AlreadyPresent {
        /// The best encoding of the digest that was refused.
        digest: String,
    },

    /// No slot matches the requested digest.
    #[error("implementation {digest} not found in the store")]
    NotFound {
        /// The best encoding of the digest that was requested.
        digest: String,
    },

    /// The computed digest disagrees with the expected one.
    #[error(transparent)]
    DigestMismatch(Box<DigestMismatch>),

    /// The filesystem cannot record modification times to the second.
    #[error("filesystem at {path} cannot store modification times accurate to the second")]
    UnstableTimestamp {
        /// The directory that was probed or walked.
        path: PathBuf,
    },

    /// A read, write or permission failure, with the operation that caused it.
    #[error("{context} {path}: {source}")]
    FileSystem {
        /// What was being attempted (e.g. "failed to read").
        context: &'static str,
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A `.manifest` file contained a line that does not follow the grammar.
    #[error("invalid manifest line {line}: {reason}")]
    InvalidManifest {
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        reason: String,
    },

    /// The tree contains an entry that cannot be represented in a manifest.
    #[error("unsupported filesystem entry {path}")]
    UnsupportedEntry {
        /// The offending path.
        path: PathBuf,
    },

    /// A path handed to the flag-file API was absolute or escaped its base.
    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    /// A mutation was attempted on a store opened without write access.
    #[error("store at {path} is read-only")]
    ReadOnly {
        /// Root directory of the store.
        path: PathBuf,
    },

    /// The progress sink requested cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Wrap an I/O error with the operation and path it occurred on.
    pub fn fs(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::FileSystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Closure form of [`StoreError::fs`] for use with `map_err`.
    pub fn fs_at<'a>(context: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::fs(context, path, source)
    }

    /// Returns the mismatch details if this is a `DigestMismatch`.
    pub fn as_mismatch(&self) -> Option<&DigestMismatch> {
        match self {
            Self::DigestMismatch(m) => Some(m),
            _ => None,
        }
    }
}

impl From<DigestMismatch> for StoreError {
    fn from(value: DigestMismatch) -> Self {
        Self::DigestMismatch(Box::new(value))
    }
}

/// A directory whose manifest digest differs from the digest it was expected to have.
#[derive(Error, Debug, Clone)]
#[error("digest mismatch: expected {expected} but got {actual}")]
pub struct DigestMismatch {
    /// The digest the implementation should have had (`prefix<sep>hash`).
    pub expected: String,
    /// The digest computed from the directory contents.
    pub actual: String,
    /// The manifest the directory had when it was added, if one was saved.
    pub expected_manifest: Option<Manifest>,
    /// The manifest generated from the directory as it is now.
    pub actual_manifest: Manifest,
}
