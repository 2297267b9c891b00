//! # zstore-cli — Implementation Cache Management
//!
//! Provides the `zstore` command-line interface over the stores configured
//! by [`zstore_cache::StoreConfig`].
//!
//! ## Subcommands
//!
//! - `zstore list`, `find`, `add`, `copy`, `remove`: slot management.
//! - `zstore verify`, `audit`: integrity checks.
//! - `zstore optimise`, `purge-staging`: housekeeping.
//! - `zstore manifest`, `digest`: inspect an arbitrary directory.
//! - `zstore flag`: edit `.xbit` / `.symlink` sidecars.
//!
//! ## Exit Codes
//!
//! `0` on success, `1` when a requested item is missing or fails
//! verification, `2` when `audit` finds damaged slots. Unexpected errors are
//! logged and also exit with `1`.

pub mod flag;
pub mod inspect;
pub mod store;

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use zstore_cache::{CompositeStore, StoreConfig};
use zstore_core::DigestSet;

/// Open the configured stores, or exactly `overrides` when any are given.
pub fn open_stores(overrides: &[PathBuf]) -> Result<CompositeStore> {
    let config = if overrides.is_empty() {
        StoreConfig::from_env()
    } else {
        let joined = env::join_paths(overrides).context("invalid --store path")?;
        StoreConfig::from_lookup(|key| match key {
            "ZSTORE_IMPLEMENTATION_DIRS" => Some(joined.clone()),
            _ => env::var_os(key),
        })
    }
    .context("failed to load store configuration")?;
    tracing::debug!(roots = ?config.implementation_dirs, "opening implementation stores");
    config.open_stores().context("failed to open implementation stores")
}

/// Parse a digest id given on the command line.
pub fn parse_digest(id: &str) -> Result<DigestSet> {
    DigestSet::from_id(id.trim()).with_context(|| format!("invalid digest '{id}'"))
}
