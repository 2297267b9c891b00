//! # zstore-core — Foundational Types for the Implementation Store
//!
//! This crate defines the value types every store operation is built on.
//! It has no knowledge of store layout; `zstore-cache` composes these
//! pieces into the content-addressed cache itself.
//!
//! ## Components
//!
//! 1. **[`DigestSet`].** One or more digests identifying the same
//!    implementation, with a fixed preference ranking over
//!    [`ManifestFormat`]s.
//!
//! 2. **[`Manifest`].** The canonical listing of a directory tree. Its
//!    serialized bytes are what gets hashed, so ordering and line grammar
//!    are fixed and versioned.
//!
//! 3. **[`flags`].** Sidecar `.xbit` / `.symlink` files that record POSIX
//!    metadata on filesystems that cannot store it natively.
//!
//! 4. **[`ProgressSink`].** Progress reporting and cancellation, passed
//!    explicitly into every long-running call.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `zstore-*` crates (this is the leaf of the DAG).
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod digest;
pub mod error;
pub mod flags;
pub mod fsutil;
pub mod manifest;
pub mod progress;

pub use digest::{DigestSet, ManifestFormat};
pub use error::{DigestMismatch, StoreError};
pub use flags::{FlagKind, FlagSet};
pub use manifest::{check_time_accuracy, Manifest, ManifestNode, TreeFlags, MANIFEST_FILE};
pub use progress::{check_cancelled, CancelToken, LogProgress, ProgressSink, SilentProgress};
