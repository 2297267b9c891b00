//! # Store Subcommands
//!
//! Slot management, integrity checks and housekeeping against the
//! configured implementation stores. Handlers take an already opened store
//! so they can be driven against a scratch directory.
//!
//! Output follows the `OK:` / `FAIL:` convention for human consumption;
//! `--json` switches listings and audit reports to machine-readable form.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use zstore_cache::{verify_directory, DirectoryLayer, ImplementationStore, StagingLayer};
use zstore_core::{DigestMismatch, Manifest, ProgressSink, StoreError};

use crate::parse_digest;

/// Arguments for `zstore list`.
#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// List leftover staging directories instead of implementations.
    #[arg(long)]
    pub staging: bool,

    /// Print JSON instead of one entry per line.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `zstore find`.
#[derive(Args, Debug)]
pub struct FindArgs {
    /// Digest id, e.g. `sha256new_<base32>` or `sha256=<hex>`.
    pub digest: String,
}

/// Arguments for `zstore add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// The digest the directory is expected to have.
    pub digest: String,

    /// Directory to copy into the store.
    pub dir: PathBuf,

    /// Only add this sub-directory of DIR.
    #[arg(long, value_name = "SUB")]
    pub sub_dir: Option<String>,
}

/// Arguments for `zstore copy`.
#[derive(Args, Debug)]
pub struct CopyArgs {
    /// A slot directory, e.g. from another store; its name is its digest.
    pub dir: PathBuf,
}

/// Arguments for `zstore remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Digest ids to remove.
    #[arg(required = true)]
    pub digests: Vec<String>,
}

/// Arguments for `zstore verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Digest ids in the store, or directories named by their own digest.
    #[arg(required = true, value_name = "DIGEST|DIR")]
    pub targets: Vec<String>,
}

/// Arguments for `zstore audit`.
#[derive(Args, Debug, Default)]
pub struct AuditArgs {
    /// Print the damaged slots as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct MismatchReport<'a> {
    expected: &'a str,
    actual: &'a str,
}

/// Print every implementation (or staging directory) in the store.
pub fn run_list(args: &ListArgs, store: &dyn ImplementationStore) -> Result<u8> {
    if args.staging {
        let paths = store.list_staging().context("failed to list staging directories")?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&paths)?);
        } else {
            for path in &paths {
                println!("{}", path.display());
            }
        }
        return Ok(0);
    }

    let digests = store.list_all().context("failed to list implementations")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&digests)?);
    } else {
        for digest in &digests {
            println!("{digest}");
        }
    }
    Ok(0)
}

/// Print the slot path of a digest.
pub fn run_find(args: &FindArgs, store: &dyn ImplementationStore) -> Result<u8> {
    let digest = parse_digest(&args.digest)?;
    match store.path_for(&digest) {
        Some(path) => {
            println!("{}", path.display());
            Ok(0)
        }
        None => {
            eprintln!("NOT FOUND: {}", args.digest);
            Ok(1)
        }
    }
}

/// Copy a directory into the store under its expected digest.
pub fn run_add(args: &AddArgs, store: &dyn ImplementationStore, progress: &dyn ProgressSink) -> Result<u8> {
    let digest = parse_digest(&args.digest)?;
    if !args.dir.is_dir() {
        anyhow::bail!("not a directory: {}", args.dir.display());
    }

    let result = match &args.sub_dir {
        None => store.add_from_directory(&args.dir, &digest, progress),
        Some(sub_dir) => {
            let layers: Vec<Box<dyn StagingLayer>> =
                vec![Box::new(DirectoryLayer::new(args.dir.clone()).with_sub_dir(sub_dir.clone()))];
            store.add_from_streams(layers, &digest, progress)
        }
    };

    match result {
        Ok(slot) => {
            println!("OK: added {} at {}", digest.best_id(), slot.display());
            Ok(0)
        }
        Err(StoreError::AlreadyPresent { digest }) => {
            println!("OK: {digest} is already present");
            Ok(0)
        }
        Err(StoreError::DigestMismatch(mismatch)) => {
            report_mismatch(&args.dir.display().to_string(), &mismatch);
            Ok(1)
        }
        Err(e) => Err(e).with_context(|| format!("failed to add {}", args.dir.display())),
    }
}

/// Add a directory named by its own digest, such as a slot of another store.
pub fn run_copy(args: &CopyArgs, store: &dyn ImplementationStore, progress: &dyn ProgressSink) -> Result<u8> {
    let name = args
        .dir
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no digest in directory name: {}", args.dir.display()))?;
    let add = AddArgs {
        digest: name.to_string(),
        dir: args.dir.clone(),
        sub_dir: None,
    };
    run_add(&add, store, progress)
}

/// Remove implementations from every store holding them.
pub fn run_remove(args: &RemoveArgs, store: &dyn ImplementationStore) -> Result<u8> {
    let mut code = 0;
    for id in &args.digests {
        let digest = parse_digest(id)?;
        match store.remove(&digest) {
            Ok(()) => println!("OK: removed {id}"),
            Err(StoreError::NotFound { .. }) => {
                eprintln!("NOT FOUND: {id}");
                code = 1;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to remove {id}")),
        }
    }
    Ok(code)
}

/// Recompute the manifest of each target and compare it with its digest.
///
/// A target naming an existing directory is checked against the digest
/// encoded in that directory's own name; anything else is looked up in the
/// store.
pub fn run_verify(args: &VerifyArgs, store: &dyn ImplementationStore, progress: &dyn ProgressSink) -> Result<u8> {
    let mut code = 0;
    for target in &args.targets {
        let dir = Path::new(target);
        let result = if dir.is_dir() {
            verify_directory(dir, progress)
        } else {
            store.verify(&parse_digest(target)?, progress)
        };
        match result {
            Ok(_) => println!("OK: {target}"),
            Err(StoreError::DigestMismatch(mismatch)) => {
                report_mismatch(target, &mismatch);
                code = 1;
            }
            Err(StoreError::NotFound { .. }) => {
                eprintln!("NOT FOUND: {target}");
                code = 1;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to verify {target}")),
        }
    }
    Ok(code)
}

/// Verify every slot in every store. Exits with `2` if any is damaged.
pub fn run_audit(args: &AuditArgs, store: &dyn ImplementationStore, progress: &dyn ProgressSink) -> Result<u8> {
    let damaged: Vec<DigestMismatch> = store.audit(progress).collect();
    if progress.is_cancelled() {
        tracing::warn!("audit cancelled; results are incomplete");
    }

    if args.json {
        let reports: Vec<MismatchReport<'_>> = damaged
            .iter()
            .map(|m| MismatchReport {
                expected: &m.expected,
                actual: &m.actual,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for mismatch in &damaged {
            report_mismatch(&mismatch.expected, mismatch);
        }
        if damaged.is_empty() {
            println!("OK: no damaged implementations found");
        }
    }
    Ok(if damaged.is_empty() { 0 } else { 2 })
}

/// Hard-link identical files across slots.
pub fn run_optimise(store: &dyn ImplementationStore, progress: &dyn ProgressSink) -> Result<u8> {
    let summary = store.optimise(progress).context("optimisation failed")?;
    println!(
        "OK: linked {} files, saved {} bytes",
        summary.files_linked, summary.bytes_saved
    );
    Ok(0)
}

/// Delete every staging directory reported by `list --staging`.
pub fn run_purge_staging(store: &dyn ImplementationStore) -> Result<u8> {
    let staging = store.list_staging().context("failed to list staging directories")?;
    for path in &staging {
        store
            .purge_staging(path)
            .with_context(|| format!("failed to purge {}", path.display()))?;
        println!("OK: purged {}", path.display());
    }
    if staging.is_empty() {
        println!("OK: nothing to purge");
    }
    Ok(0)
}

fn report_mismatch(subject: &str, mismatch: &DigestMismatch) {
    println!("FAIL: {subject}: {mismatch}");
    if let Some(expected) = &mismatch.expected_manifest {
        for line in manifest_diff(expected, &mismatch.actual_manifest) {
            println!("  {line}");
        }
    }
}

/// Lines only in `expected` prefixed with `-`, lines only in `actual` with `+`.
fn manifest_diff(expected: &Manifest, actual: &Manifest) -> Vec<String> {
    let old = expected.to_text();
    let new = actual.to_text();
    let old_lines: BTreeSet<&str> = old.lines().collect();
    let new_lines: BTreeSet<&str> = new.lines().collect();
    let removed = old.lines().filter(|l| !new_lines.contains(l)).map(|l| format!("-{l}"));
    let added = new.lines().filter(|l| !old_lines.contains(l)).map(|l| format!("+{l}"));
    removed.chain(added).collect()
}
