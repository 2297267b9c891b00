//! Small filesystem helpers shared by the manifest, flag-file and store code.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::StoreError;

/// A random name of the form `xxxxxxxx.xxx` (lowercase alphanumerics).
///
/// The alphabet excludes `=` and `_`, so these names can never be mistaken
/// for digest-named slots.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let chars: String = (0..11)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .collect();
    format!("{}.{}", &chars[..8], &chars[8..])
}

/// Write `contents` to `path` by writing a sibling temp file and renaming it
/// over the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let temp = temp_sibling(path);
    let result = (|| -> Result<(), StoreError> {
        let mut file = fs::File::create(&temp).map_err(StoreError::fs_at("failed to create", &temp))?;
        file.write_all(contents)
            .map_err(StoreError::fs_at("failed to write", &temp))?;
        file.sync_all().map_err(StoreError::fs_at("failed to flush", &temp))?;
        fs::rename(&temp, path).map_err(StoreError::fs_at("failed to replace", path))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", random_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_names_never_parse_as_digests() {
        for _ in 0..100 {
            let name = random_name();
            assert_eq!(name.len(), 12);
            assert!(!name.contains('=') && !name.contains('_'));
            assert!(crate::digest::DigestSet::parse_slot_name(&name).is_none());
        }
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
