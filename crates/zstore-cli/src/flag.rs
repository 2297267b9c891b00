//! # Flag Subcommand
//!
//! Edits the `.xbit` and `.symlink` sidecars of a staged tree, for content
//! prepared on filesystems that cannot record those properties natively.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use zstore_core::flags::{clear_flag, read_flags, rename_flag, set_flag};
use zstore_core::FlagKind;

/// Arguments for `zstore flag`.
#[derive(Args, Debug)]
pub struct FlagArgs {
    /// Directory whose sidecar is edited.
    #[arg(long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Edit the `.symlink` sidecar instead of `.xbit`.
    #[arg(long, global = true)]
    pub symlink: bool,

    #[command(subcommand)]
    pub command: FlagCommand,
}

/// Flag subcommands. Paths are relative to `--root`.
#[derive(Subcommand, Debug)]
pub enum FlagCommand {
    /// Record a path.
    Set { path: String },

    /// Drop a path and everything below it.
    Clear { path: String },

    /// Move the records for a path to a new path.
    Rename { source: String, destination: String },

    /// Print the records that apply to `--root`.
    Show,
}

/// Execute the flag subcommand.
pub fn run_flag(args: &FlagArgs) -> Result<u8> {
    let kind = if args.symlink {
        FlagKind::Symlink
    } else {
        FlagKind::Executable
    };
    let sidecar = args.root.join(kind.file_name());

    match &args.command {
        FlagCommand::Set { path } => {
            set_flag(&sidecar, path).with_context(|| format!("failed to flag {path}"))?;
        }
        FlagCommand::Clear { path } => {
            clear_flag(&sidecar, path).with_context(|| format!("failed to clear {path}"))?;
        }
        FlagCommand::Rename { source, destination } => {
            rename_flag(&sidecar, source, destination)
                .with_context(|| format!("failed to rename {source} to {destination}"))?;
        }
        FlagCommand::Show => {
            let flags = read_flags(kind, &args.root).context("failed to read flags")?;
            if let Some(base) = flags.base() {
                tracing::debug!(base = %base.display(), "found sidecar");
            }
            for path in flags.paths() {
                println!("{path}");
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn args(root: PathBuf, symlink: bool, command: FlagCommand) -> FlagArgs {
        FlagArgs {
            root,
            symlink,
            command,
        }
    }

    #[test]
    fn set_rename_clear_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let sidecar = root.join(".xbit");

        let set = args(root.clone(), false, FlagCommand::Set { path: "bin/tool".into() });
        assert_eq!(run_flag(&set).unwrap(), 0);
        assert_eq!(fs::read_to_string(&sidecar).unwrap(), "/bin/tool\n");

        let rename = args(
            root.clone(),
            false,
            FlagCommand::Rename {
                source: "bin".into(),
                destination: "libexec".into(),
            },
        );
        run_flag(&rename).unwrap();
        assert_eq!(fs::read_to_string(&sidecar).unwrap(), "/libexec/tool\n");

        run_flag(&args(root.clone(), false, FlagCommand::Show)).unwrap();
        run_flag(&args(root, false, FlagCommand::Clear { path: "libexec".into() })).unwrap();
        assert_eq!(fs::read_to_string(&sidecar).unwrap(), "");
    }

    #[test]
    fn symlink_switch_selects_other_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let set = args(dir.path().to_path_buf(), true, FlagCommand::Set { path: "link".into() });
        run_flag(&set).unwrap();
        assert!(dir.path().join(".symlink").is_file());
        assert!(!dir.path().join(".xbit").exists());
    }

    #[test]
    fn escaping_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let set = args(dir.path().to_path_buf(), false, FlagCommand::Set { path: "../x".into() });
        assert!(run_flag(&set).is_err());
    }
}
