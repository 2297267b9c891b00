//! # zstore CLI entry point
//!
//! Parses command-line arguments, installs logging and dispatches to the
//! subcommand handlers in the library crate.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zstore_cli::flag::{run_flag, FlagArgs};
use zstore_cli::inspect::{run_digest, run_manifest, DigestArgs, ManifestArgs};
use zstore_cli::open_stores;
use zstore_cli::store::{
    run_add, run_audit, run_copy, run_find, run_list, run_optimise, run_purge_staging, run_remove, run_verify, AddArgs,
    AuditArgs, CopyArgs, FindArgs, ListArgs, RemoveArgs, VerifyArgs,
};
use zstore_core::LogProgress;

/// zstore: content-addressed implementation cache
///
/// Stores unpacked implementation directories under the digest of their
/// manifest, verifies them on the way in, and keeps them immutable.
#[derive(Parser, Debug)]
#[command(name = "zstore", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use this store root instead of the configured ones. Repeatable.
    #[arg(long = "store", value_name = "DIR", global = true)]
    stores: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored implementations.
    List(ListArgs),

    /// Print the directory holding an implementation.
    Find(FindArgs),

    /// Add a directory under its expected digest.
    Add(AddArgs),

    /// Add a directory whose name is its digest, e.g. a slot of another store.
    Copy(CopyArgs),

    /// Remove implementations.
    Remove(RemoveArgs),

    /// Check implementations against their digests.
    Verify(VerifyArgs),

    /// Verify every stored implementation.
    Audit(AuditArgs),

    /// Print the manifest of a directory.
    Manifest(ManifestArgs),

    /// Print all recommended digests of a directory.
    Digest(DigestArgs),

    /// Hard-link identical files shared between implementations.
    #[command(alias = "optimize")]
    Optimise,

    /// Delete leftover staging directories.
    PurgeStaging,

    /// Edit executable and symlink flag files.
    Flag(FlagArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "zstore starting");

    let progress = LogProgress::default();
    let stores = &cli.stores;

    let result = match cli.command {
        Commands::Manifest(args) => run_manifest(&args, &progress),
        Commands::Digest(args) => run_digest(&args, &progress),
        Commands::Flag(args) => run_flag(&args),
        Commands::List(args) => open_stores(stores).and_then(|s| run_list(&args, &s)),
        Commands::Find(args) => open_stores(stores).and_then(|s| run_find(&args, &s)),
        Commands::Add(args) => open_stores(stores).and_then(|s| run_add(&args, &s, &progress)),
        Commands::Copy(args) => open_stores(stores).and_then(|s| run_copy(&args, &s, &progress)),
        Commands::Remove(args) => open_stores(stores).and_then(|s| run_remove(&args, &s)),
        Commands::Verify(args) => open_stores(stores).and_then(|s| run_verify(&args, &s, &progress)),
        Commands::Audit(args) => open_stores(stores).and_then(|s| run_audit(&args, &s, &progress)),
        Commands::Optimise => open_stores(stores).and_then(|s| run_optimise(&s, &progress)),
        Commands::PurgeStaging => open_stores(stores).and_then(|s| run_purge_staging(&s)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
