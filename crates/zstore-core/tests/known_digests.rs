//! # Known Digest Vectors
//!
//! Builds a small tree with fixed timestamps and checks the manifest text
//! and its digests against values computed independently with `sha256sum`,
//! `sha1sum` and `base32`. If these fail, previously stored implementations
//! would no longer verify.

use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use zstore_core::flags::{set_flag, XBIT_FILE};
use zstore_core::{DigestSet, Manifest, ManifestFormat, SilentProgress};

const MTIME: u64 = 1_000_000_000;

fn write(path: &Path, content: &[u8]) {
    fs::write(path, content).unwrap();
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(MTIME)).unwrap();
}

fn build_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("README"), b"hi");
    write(&dir.path().join("run.sh"), b"#!/bin/sh\n");
    fs::create_dir(dir.path().join("docs")).unwrap();
    write(&dir.path().join("docs").join("guide.txt"), b"guide");
    set_flag(&dir.path().join(XBIT_FILE), "run.sh").unwrap();
    dir
}

const EXPECTED_SHA256_MANIFEST: &str = "\
F 8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4 1000000000 2 README
X a8076d3d28d21e02012b20eaf7dbf75409a6277134439025f282e368e3305abf 1000000000 10 run.sh
D /docs
F 83ca68be6227af2feb15f227485ed18aff8ecae99416a4bd6df3be1b5e8059b4 1000000000 5 guide.txt
";

#[test]
fn sha256_manifest_text_is_stable() {
    let tree = build_tree();
    let manifest = Manifest::for_directory(tree.path(), ManifestFormat::Sha256, &SilentProgress).unwrap();
    assert_eq!(manifest.to_text(), EXPECTED_SHA256_MANIFEST);
    assert_eq!(manifest.total_size(), 17);
}

#[test]
fn recommended_digests_match_reference_values() {
    let tree = build_tree();
    let set = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    assert_eq!(
        set.get(ManifestFormat::Sha256),
        Some("9fcbd8b449528ab2d91197548886e4465f987f6525394e9eaebfd054c8210313")
    );
    assert_eq!(
        set.get(ManifestFormat::Sha256New),
        Some("t7f5rncjkkflfwirs5kirbxeizpzq73feu4u5hvox7ifjsbbamjq")
    );
    assert_eq!(
        set.get(ManifestFormat::Sha1New),
        Some("fa5e2e9ca4f04fc74b95ceb4060b3c41c65f709a")
    );
    assert_eq!(
        set.best_id(),
        "sha256new_t7f5rncjkkflfwirs5kirbxeizpzq73feu4u5hvox7ifjsbbamjq"
    );
}

#[test]
fn expected_digest_from_caller_matches_generated() {
    let tree = build_tree();
    let expected = DigestSet::from_expected([
        ("sha256", "9fcbd8b449528ab2d91197548886e4465f987f6525394e9eaebfd054c8210313"),
        ("blake9", "whatever"),
    ])
    .unwrap();
    let actual = Manifest::create_digest(tree.path(), &SilentProgress).unwrap();
    assert!(expected.partial_eq(&actual));
}
