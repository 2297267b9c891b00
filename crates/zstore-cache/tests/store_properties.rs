//! # Store Properties
//!
//! End-to-end checks of the add / verify / remove protocol against a real
//! directory store: round-trips, tamper detection, collision handling,
//! atomic removal under concurrency, and the flag-file fallback.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use zstore_cache::protect::unprotect;
use zstore_cache::{DirectoryStore, ImplementationStore, StoreKind};
use zstore_core::flags::{clear_flag, set_flag, XBIT_FILE};
use zstore_core::{DigestSet, Manifest, ManifestFormat, ManifestNode, SilentProgress, StoreError};

const MTIME: u64 = 1_700_000_000;

/// Temporary directory that lifts write protection before deletion.
struct Scratch(tempfile::TempDir);

impl Scratch {
    fn new() -> Self {
        Self(tempfile::tempdir().unwrap())
    }

    fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = unprotect(self.0.path());
    }
}

fn write(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(MTIME)).unwrap();
}

fn plain_tree() -> Scratch {
    let dir = Scratch::new();
    write(&dir.path().join("README"), b"hello");
    write(&dir.path().join("lib").join("core.so"), b"\x7fELF....");
    write(&dir.path().join("lib").join("data").join("table.bin"), &[0u8; 300]);
    dir
}

fn open_store(scratch: &Scratch) -> DirectoryStore {
    DirectoryStore::open(scratch.path().join("store")).unwrap()
}

#[test]
fn round_trip_preserves_manifest_bytes() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();

    store.add_from_directory(tree.path(), &digest, &SilentProgress).unwrap();
    let slot = store.path_for(&digest).expect("slot exists");

    for format in ManifestFormat::RECOMMENDED {
        let original = Manifest::for_directory(tree.path(), format, &SilentProgress).unwrap();
        let stored = Manifest::for_directory(&slot, format, &SilentProgress).unwrap();
        assert_eq!(original.serialize(), stored.serialize(), "{format}");
    }
    let saved = Manifest::load(&slot.join(".manifest"), digest.best().0).unwrap();
    assert_eq!(saved.total_size(), 5 + 8 + 300);
}

#[test]
fn flipping_one_byte_is_detected() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    let slot = store.add_from_directory(tree.path(), &digest, &SilentProgress).unwrap();

    let victim = slot.join("lib").join("data").join("table.bin");
    unprotect(&slot).unwrap();
    let mut bytes = fs::read(&victim).unwrap();
    bytes[0] ^= 0x01;
    write(&victim, &bytes);

    let err = store.verify(&digest, &SilentProgress).unwrap_err();
    let mismatch = err.as_mismatch().expect("digest mismatch");
    assert_ne!(mismatch.actual, mismatch.expected);
    assert_eq!(mismatch.expected, digest.best_id());
    assert!(mismatch.expected_manifest.is_some());

    let audited: Vec<_> = store.audit(&SilentProgress).collect();
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].expected, digest.best_id());
}

#[test]
fn second_add_reports_already_present() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();

    store.add_from_directory(tree.path(), &digest, &SilentProgress).unwrap();
    let err = store.add_from_directory(tree.path(), &digest, &SilentProgress).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyPresent { .. }));
    assert_eq!(store.list_all().unwrap(), vec![DigestSet::from_id(&digest.best_id()).unwrap()]);
    assert!(store.list_staging().unwrap().is_empty());
}

#[test]
fn concurrent_adds_promote_exactly_once() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();

    let results: Vec<Result<PathBuf, StoreError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| store.add_from_directory(tree.path(), &digest, &SilentProgress)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result, Err(StoreError::AlreadyPresent { .. })), "{result:?}");
    }
    assert_eq!(store.list_all().unwrap().len(), 1);
    assert!(store.list_staging().unwrap().is_empty());
    store.verify(&digest, &SilentProgress).unwrap();
}

#[test]
fn removal_is_never_observed_half_done() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    let files = ["README", "lib/core.so", "lib/data/table.bin"];

    for _ in 0..20 {
        store.add_from_directory(tree.path(), &digest, &SilentProgress).unwrap();
        thread::scope(|s| {
            s.spawn(|| store.remove(&digest).unwrap());
            s.spawn(|| {
                while let Some(slot) = store.path_for(&digest) {
                    for file in files {
                        let path = slot.join(file);
                        match fs::symlink_metadata(&path) {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                                // The only acceptable reason is that the whole slot is gone.
                                assert!(!slot.exists(), "{} missing while slot visible", path.display());
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            });
        });
        assert!(!store.contains(&digest));
        assert!(store.list_staging().unwrap().is_empty());
    }
}

#[test]
fn exec_flag_only_changes_that_entry() {
    let tree = plain_tree();
    write(&tree.path().join("bin").join("tool"), b"#!/bin/sh\necho hi\n");
    let sidecar = tree.path().join(XBIT_FILE);

    set_flag(&sidecar, "bin/tool").unwrap();
    let flagged = Manifest::for_directory(tree.path(), ManifestFormat::Sha256, &SilentProgress).unwrap();
    clear_flag(&sidecar, "bin/tool").unwrap();
    let plain = Manifest::for_directory(tree.path(), ManifestFormat::Sha256, &SilentProgress).unwrap();

    assert_ne!(flagged, plain);
    let (a, b) = (flagged.entries(), plain.entries());
    assert_eq!(a.len(), b.len());
    for ((path_a, node_a), (path_b, node_b)) in a.iter().zip(b.iter()) {
        assert_eq!(path_a, path_b);
        if path_a == "bin/tool" {
            match (node_a, node_b) {
                (
                    ManifestNode::ExecutableFile { hash: h1, mtime: m1, size: s1, .. },
                    ManifestNode::File { hash: h2, mtime: m2, size: s2, .. },
                ) => assert_eq!((h1, m1, s1), (h2, m2, s2)),
                other => panic!("unexpected kinds: {other:?}"),
            }
        } else {
            assert_eq!(node_a, node_b);
        }
    }
}

#[test]
fn readme_and_flagged_script_scenario() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let staging = Scratch::new();
    write(&staging.path().join("README"), b"hi");
    write(&staging.path().join("run.sh"), b"#!/bin/sh\n");
    set_flag(&staging.path().join(XBIT_FILE), "run.sh").unwrap();

    let format = ManifestFormat::Sha256;
    let text = format!(
        "F {} {MTIME} 2 README\nX {} {MTIME} 10 run.sh\n",
        format.digest_content(b"hi"),
        format.digest_content(b"#!/bin/sh\n"),
    );
    let expected = DigestSet::from_expected([("sha256", format.digest_manifest(text.as_bytes()))]).unwrap();

    store.add_from_directory(staging.path(), &expected, &SilentProgress).unwrap();
    assert_eq!(store.list_all().unwrap(), vec![expected.clone()]);
    let manifest = store.verify(&expected, &SilentProgress).unwrap();
    assert_eq!(manifest.to_text(), text);
}

#[test]
fn legacy_encodings_are_found() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let sha1new = Manifest::for_directory(tree.path(), ManifestFormat::Sha1New, &SilentProgress)
        .unwrap()
        .digest();
    store.add_from_directory(tree.path(), &sha1new, &SilentProgress).unwrap();
    assert!(store.root().join(sha1new.best_id()).is_dir());

    // A caller knowing several digests still finds the legacy slot.
    let full = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    assert_eq!(store.path_for(&full), Some(store.root().join(sha1new.best_id())));
    store.verify(&full, &SilentProgress).unwrap();
}

#[test]
fn best_encoding_wins_among_alias_slots() {
    let scratch = Scratch::new();
    let store = open_store(&scratch);
    let tree = plain_tree();
    let digest_in = |format| {
        Manifest::for_directory(tree.path(), format, &SilentProgress)
            .unwrap()
            .digest()
    };
    let sha1new = digest_in(ManifestFormat::Sha1New);
    let sha256new = digest_in(ManifestFormat::Sha256New);
    store.add_from_directory(tree.path(), &sha1new, &SilentProgress).unwrap();
    store.add_from_directory(tree.path(), &sha256new, &SilentProgress).unwrap();
    assert!(store.root().join(sha1new.best_id()).is_dir());
    assert!(sha256new.best_id().starts_with("sha256new_"));

    let full = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    assert_eq!(store.path_for(&full), Some(store.root().join(sha256new.best_id())));
    assert_eq!(store.path_for(&sha1new), Some(store.root().join(sha1new.best_id())));
}

#[cfg(unix)]
#[test]
fn unwritable_root_opens_read_only() {
    use std::os::unix::fs::PermissionsExt;
    let scratch = Scratch::new();
    let root = scratch.path().join("shared");
    fs::create_dir(&root).unwrap();
    fs::set_permissions(&root, fs::Permissions::from_mode(0o555)).unwrap();
    if File::create(root.join("probe")).is_ok() {
        // Running with privileges that ignore permissions.
        return;
    }

    let store = DirectoryStore::open(&root).unwrap();
    assert_eq!(store.kind(), StoreKind::ReadOnly);
    let tree = plain_tree();
    let digest = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    assert!(matches!(
        store.add_from_directory(tree.path(), &digest, &SilentProgress),
        Err(StoreError::ReadOnly { .. })
    ));
    assert!(matches!(store.remove(&digest), Err(StoreError::ReadOnly { .. })));
}
