//! # zstore-cache — Content-Addressed Implementation Cache
//!
//! Stores immutable implementation directories, each named by the digest of
//! its manifest. An implementation only becomes visible under its digest
//! name after its content has been hashed and compared with the digest the
//! caller expected, and it is write-protected once promoted.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   sha256new_<base32>/      promoted slot
//!     .manifest              manifest saved at add time
//!     ...                    implementation files
//!   sha1new=<hex>/           slot named with a legacy encoding
//!   k3j9x0ab.q1z/            staging directory (never parses as a digest)
//! ```
//!
//! ## Modules
//!
//! - [`store`]: the [`ImplementationStore`] trait.
//! - [`directory`]: [`DirectoryStore`], one root directory.
//! - [`composite`]: [`CompositeStore`], several stores in priority order.
//! - [`layer`]: sources applied into a staging directory.
//! - [`config`]: which roots make up the cache.
//! - [`protect`]: write protection of promoted slots.

pub mod composite;
pub mod config;
pub mod copy;
pub mod directory;
pub mod layer;
pub mod protect;
pub mod store;

pub use composite::CompositeStore;
pub use config::{ConfigError, StoreConfig};
pub use directory::{verify_directory, DirectoryStore, StoreOptions};
pub use layer::{DirectoryLayer, StagingLayer, StreamLayer};
pub use store::{ImplementationStore, OptimiseSummary, StoreKind};
