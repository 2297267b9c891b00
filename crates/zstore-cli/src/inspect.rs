//! # Inspection Subcommands
//!
//! `manifest` and `digest` work on any directory and never touch a store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use zstore_core::{DigestSet, Manifest, ManifestFormat, ProgressSink};

/// Arguments for `zstore manifest`.
#[derive(Args, Debug)]
pub struct ManifestArgs {
    /// Directory to describe.
    pub dir: PathBuf,

    /// Manifest format (`sha256new`, `sha256`, `sha1new`, `sha1`). Defaults
    /// to the format in the directory's name, else the best recommended one.
    #[arg(long, value_name = "PREFIX")]
    pub algorithm: Option<String>,
}

/// Arguments for `zstore digest`.
#[derive(Args, Debug)]
pub struct DigestArgs {
    /// Directory to digest.
    pub dir: PathBuf,

    /// Print the digests as a JSON object.
    #[arg(long)]
    pub json: bool,
}

/// Print the manifest of a directory followed by its digest id.
pub fn run_manifest(args: &ManifestArgs, progress: &dyn ProgressSink) -> Result<u8> {
    let format = resolve_format(&args.dir, args.algorithm.as_deref())?;
    let manifest = Manifest::for_directory(&args.dir, format, progress)
        .with_context(|| format!("failed to generate manifest for {}", args.dir.display()))?;
    print!("{manifest}");
    println!("{}", manifest.digest_id());
    Ok(0)
}

/// Print every recommended digest of a directory.
pub fn run_digest(args: &DigestArgs, progress: &dyn ProgressSink) -> Result<u8> {
    let digest = Manifest::create_digest(&args.dir, progress)
        .with_context(|| format!("failed to digest {}", args.dir.display()))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&digest)?);
    } else {
        for id in digest.available_ids() {
            println!("{id}");
        }
    }
    Ok(0)
}

fn resolve_format(dir: &Path, algorithm: Option<&str>) -> Result<ManifestFormat> {
    if let Some(name) = algorithm {
        return ManifestFormat::from_prefix(name).with_context(|| format!("unknown algorithm '{name}'"));
    }
    let from_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(DigestSet::parse_slot_name)
        .map(|d| d.best().0);
    Ok(from_name.unwrap_or(ManifestFormat::RECOMMENDED[0]))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use zstore_core::SilentProgress;

    #[test]
    fn explicit_algorithm_wins() {
        let dir = Path::new("/tmp/sha1new=0000000000000000000000000000000000000000");
        assert_eq!(resolve_format(dir, Some("sha256")).unwrap(), ManifestFormat::Sha256);
    }

    #[test]
    fn format_comes_from_directory_name() {
        let dir = PathBuf::from(format!("cache/sha1new={}", "0".repeat(40)));
        assert_eq!(resolve_format(&dir, None).unwrap(), ManifestFormat::Sha1New);
        assert_eq!(resolve_format(Path::new("cache/plain"), None).unwrap(), ManifestFormat::Sha256New);
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        let err = resolve_format(Path::new("x"), Some("md5")).unwrap_err();
        assert!(err.to_string().contains("unknown algorithm"));
    }

    #[test]
    fn manifest_and_digest_of_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), b"content").unwrap();

        let manifest = ManifestArgs {
            dir: dir.path().to_path_buf(),
            algorithm: Some("sha1new".to_string()),
        };
        assert_eq!(run_manifest(&manifest, &SilentProgress).unwrap(), 0);
        let digest = DigestArgs {
            dir: dir.path().to_path_buf(),
            json: true,
        };
        assert_eq!(run_digest(&digest, &SilentProgress).unwrap(), 0);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = DigestArgs {
            dir: dir.path().join("absent"),
            json: false,
        };
        assert!(run_digest(&args, &SilentProgress).is_err());
    }
}
