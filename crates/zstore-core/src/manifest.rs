//! # Manifests — Canonical Directory Listings
//!
//! A [`Manifest`] is a deterministic, line-oriented listing of a directory
//! tree. Its serialized bytes are hashed to produce the implementation's
//! digest, so two trees with the same content, executable bits, symlinks
//! and modification times always produce identical bytes.
//!
//! ## Grammar (v1)
//!
//! ```text
//! new:  D /<dir path>
//! old:  D <mtime> /<dir path>
//! all:  F <hash> <mtime> <size> <name>
//!       X <hash> <mtime> <size> <name>
//!       S <hash> <size> <name>
//! ```
//!
//! `<name>` is the last path component and the last field, so it may contain
//! spaces. Lines end with `\n`. File lines follow the `D` line of their
//! directory; top-level files come before any `D` line.
//!
//! ## Ordering
//!
//! The *new* ordering (`sha1new`, `sha256`, `sha256new`) lists a directory's
//! files and symlinks sorted byte-wise, then each subdirectory sorted
//! byte-wise as a `D` line followed by its contents. The *old* ordering
//! (`sha1`) merges files and directories into a single sort.
//!
//! Symlinks are never followed. On filesystems without native executable
//! bits or symlinks, the `.xbit` and `.symlink` sidecars (see
//! [`crate::flags`]) fill the gap.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::digest::{DigestSet, ManifestFormat};
use crate::error::StoreError;
use crate::flags::{read_flags, FlagKind, FlagSet, SYMLINK_FILE, XBIT_FILE};
use crate::fsutil::random_name;
use crate::progress::{check_cancelled, ProgressSink};

/// Name of the manifest file saved inside every slot.
pub const MANIFEST_FILE: &str = ".manifest";

const READ_CHUNK: usize = 64 * 1024;

/// One line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestNode {
    /// A regular, non-executable file.
    File {
        hash: String,
        mtime: i64,
        size: u64,
        name: String,
    },
    /// A regular file with the executable bit set.
    ExecutableFile {
        hash: String,
        mtime: i64,
        size: u64,
        name: String,
    },
    /// A symbolic link; `hash` and `size` describe the target text.
    Symlink { hash: String, size: u64, name: String },
    /// A directory. `mtime` is only recorded by the old ordering.
    Directory { mtime: Option<i64>, path: String },
}

impl ManifestNode {
    /// Byte length contributed to [`Manifest::total_size`].
    pub fn file_size(&self) -> u64 {
        match self {
            Self::File { size, .. } | Self::ExecutableFile { size, .. } => *size,
            Self::Symlink { .. } | Self::Directory { .. } => 0,
        }
    }

    fn write_line(&self, format: ManifestFormat, out: &mut String) {
        use std::fmt::Write;
        // Writing into a String cannot fail.
        let _ = match self {
            Self::File { hash, mtime, size, name } => writeln!(out, "F {hash} {mtime} {size} {name}"),
            Self::ExecutableFile { hash, mtime, size, name } => {
                writeln!(out, "X {hash} {mtime} {size} {name}")
            }
            Self::Symlink { hash, size, name } => writeln!(out, "S {hash} {size} {name}"),
            Self::Directory { mtime, path } if format.uses_old_ordering() => {
                writeln!(out, "D {} {path}", mtime.unwrap_or(0))
            }
            Self::Directory { path, .. } => writeln!(out, "D {path}"),
        };
    }

    fn parse_line(line: &str, format: ManifestFormat, number: usize) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidManifest {
            line: number,
            reason: reason.to_string(),
        };
        let (kind, rest) = line.split_once(' ').ok_or_else(|| invalid("missing fields"))?;
        match kind {
            "F" | "X" => {
                let fields: Vec<&str> = rest.splitn(4, ' ').collect();
                let [hash, mtime, size, name] = fields[..] else {
                    return Err(invalid("file entries need hash, mtime, size and name"));
                };
                let (hash, name) = (parse_hash(hash, &invalid)?, parse_name(name, &invalid)?);
                let mtime = mtime.parse().map_err(|_| invalid("mtime is not an integer"))?;
                let size = size.parse().map_err(|_| invalid("size is not an integer"))?;
                Ok(if kind == "F" {
                    Self::File { hash, mtime, size, name }
                } else {
                    Self::ExecutableFile { hash, mtime, size, name }
                })
            }
            "S" => {
                let fields: Vec<&str> = rest.splitn(3, ' ').collect();
                let [hash, size, name] = fields[..] else {
                    return Err(invalid("symlink entries need hash, size and name"));
                };
                Ok(Self::Symlink {
                    hash: parse_hash(hash, &invalid)?,
                    size: size.parse().map_err(|_| invalid("size is not an integer"))?,
                    name: parse_name(name, &invalid)?,
                })
            }
            "D" if format.uses_old_ordering() => {
                let (mtime, path) = rest
                    .split_once(' ')
                    .ok_or_else(|| invalid("directory entries need mtime and path"))?;
                let mtime = mtime.parse().map_err(|_| invalid("mtime is not an integer"))?;
                Ok(Self::Directory {
                    mtime: Some(mtime),
                    path: parse_dir_path(path, &invalid)?,
                })
            }
            "D" => Ok(Self::Directory {
                mtime: None,
                path: parse_dir_path(rest, &invalid)?,
            }),
            _ => Err(invalid("unknown entry type")),
        }
    }
}

fn parse_hash(hash: &str, invalid: &dyn Fn(&str) -> StoreError) -> Result<String, StoreError> {
    if !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(hash.to_string())
    } else {
        Err(invalid("hash is not hexadecimal"))
    }
}

fn parse_name(name: &str, invalid: &dyn Fn(&str) -> StoreError) -> Result<String, StoreError> {
    if name.is_empty() || name.contains('/') {
        Err(invalid("name must be a single path component"))
    } else {
        Ok(name.to_string())
    }
}

fn parse_dir_path(path: &str, invalid: &dyn Fn(&str) -> StoreError) -> Result<String, StoreError> {
    if path.len() > 1 && path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Err(invalid("directory path must start with '/'"))
    }
}

/// Flag sidecars consulted while generating a manifest.
#[derive(Debug, Clone, Default)]
pub struct TreeFlags {
    /// Paths recorded in `.xbit`.
    pub executable: FlagSet,
    /// Paths recorded in `.symlink`.
    pub symlink: FlagSet,
}

impl TreeFlags {
    /// Find the sidecars that apply to `root` by searching upward from it.
    pub fn discover(root: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            executable: read_flags(FlagKind::Executable, root)?,
            symlink: read_flags(FlagKind::Symlink, root)?,
        })
    }
}

/// A canonical listing of a directory tree in one [`ManifestFormat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    format: ManifestFormat,
    nodes: Vec<ManifestNode>,
}

impl Manifest {
    /// A manifest made of the given nodes, which must already be in canonical order.
    pub fn new(format: ManifestFormat, nodes: Vec<ManifestNode>) -> Self {
        Self { format, nodes }
    }

    /// The manifest of an empty directory.
    pub fn empty(format: ManifestFormat) -> Self {
        Self::new(format, Vec::new())
    }

    /// The format this manifest was generated or parsed in.
    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// The nodes in canonical order.
    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// Walk `root` and build its manifest, consulting `flags` for executable
    /// bits and symlinks the filesystem cannot represent.
    pub fn generate(
        root: &Path,
        format: ManifestFormat,
        flags: &TreeFlags,
        progress: &dyn ProgressSink,
    ) -> Result<Self, StoreError> {
        let root = fs::canonicalize(root).map_err(StoreError::fs_at("failed to resolve", root))?;
        let mut walker = Walker {
            format,
            flags,
            progress,
            nodes: Vec::new(),
            bytes_done: 0,
        };
        walker.walk(&root, "")?;
        Ok(Self::new(format, walker.nodes))
    }

    /// [`Manifest::generate`] with the flag sidecars discovered from `root`.
    pub fn for_directory(
        root: &Path,
        format: ManifestFormat,
        progress: &dyn ProgressSink,
    ) -> Result<Self, StoreError> {
        let root = fs::canonicalize(root).map_err(StoreError::fs_at("failed to resolve", root))?;
        let flags = TreeFlags::discover(&root)?;
        Self::generate(&root, format, &flags, progress)
    }

    /// Compute the digest of `root` in every recommended format.
    pub fn create_digest(root: &Path, progress: &dyn ProgressSink) -> Result<DigestSet, StoreError> {
        let root = fs::canonicalize(root).map_err(StoreError::fs_at("failed to resolve", root))?;
        let flags = TreeFlags::discover(&root)?;
        let mut listings: Vec<Manifest> = Vec::new();
        let mut set: Option<DigestSet> = None;
        for format in ManifestFormat::RECOMMENDED {
            // Formats that share a content hash and ordering produce the same lines.
            let manifest = match listings.iter().find(|m| same_listing(m.format, format)) {
                Some(existing) => Manifest::new(format, existing.nodes.clone()),
                None => Manifest::generate(&root, format, &flags, progress)?,
            };
            let hash = format.digest_manifest(&manifest.serialize());
            match &mut set {
                Some(set) => set.add_computed(format, hash),
                None => set = Some(DigestSet::computed(format, hash)),
            }
            listings.push(manifest);
        }
        set.ok_or_else(|| StoreError::InvalidDigest("no recommended formats".to_string()))
    }

    /// The canonical text, as hashed for the digest.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            node.write_line(self.format, &mut out);
        }
        out
    }

    /// The canonical bytes, as hashed for the digest.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }

    /// The digest of this manifest in its own format.
    pub fn digest(&self) -> DigestSet {
        DigestSet::computed(self.format, self.format.digest_manifest(&self.serialize()))
    }

    /// The digest rendered as an id (e.g. `sha256=...`).
    pub fn digest_id(&self) -> String {
        self.digest().best_id()
    }

    /// Sum of all file sizes; symlinks and directories count as zero.
    pub fn total_size(&self) -> u64 {
        self.nodes.iter().map(ManifestNode::file_size).sum()
    }

    /// Every node paired with its path relative to the tree root (no leading `/`).
    pub fn entries(&self) -> Vec<(String, &ManifestNode)> {
        let mut current = "";
        let mut out = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let path = match node {
                ManifestNode::Directory { path, .. } => {
                    current = path.trim_start_matches('/');
                    current.to_string()
                }
                ManifestNode::File { name, .. }
                | ManifestNode::ExecutableFile { name, .. }
                | ManifestNode::Symlink { name, .. } => {
                    if current.is_empty() {
                        name.clone()
                    } else {
                        format!("{current}/{name}")
                    }
                }
            };
            out.push((path, node));
        }
        out
    }

    /// Parse manifest text written in `format`.
    ///
    /// Lines end at `\n` only; a `\r` before it belongs to the entry name.
    pub fn parse(text: &str, format: ManifestFormat) -> Result<Self, StoreError> {
        let nodes = text
            .split_terminator('\n')
            .enumerate()
            .map(|(i, line)| ManifestNode::parse_line(line, format, i + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(format, nodes))
    }

    /// Read and parse a `.manifest` file.
    pub fn load(path: &Path, format: ManifestFormat) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(StoreError::fs_at("failed to read", path))?;
        Self::parse(&text, format)
    }

    /// Write the canonical text to `path` and return the digest id.
    pub fn save(&self, path: &Path) -> Result<String, StoreError> {
        let bytes = self.serialize();
        fs::write(path, &bytes).map_err(StoreError::fs_at("failed to write", path))?;
        Ok(self.format.id_for(&self.format.digest_manifest(&bytes)))
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

fn same_listing(a: ManifestFormat, b: ManifestFormat) -> bool {
    let sha256 = |f: ManifestFormat| matches!(f, ManifestFormat::Sha256New | ManifestFormat::Sha256);
    a.uses_old_ordering() == b.uses_old_ordering() && sha256(a) == sha256(b)
}

struct Entry {
    name: String,
    path: PathBuf,
    meta: fs::Metadata,
}

struct Walker<'a> {
    format: ManifestFormat,
    flags: &'a TreeFlags,
    progress: &'a dyn ProgressSink,
    nodes: Vec<ManifestNode>,
    bytes_done: u64,
}

impl Walker<'_> {
    fn walk(&mut self, dir: &Path, rel: &str) -> Result<(), StoreError> {
        let entries = read_sorted(dir, rel.is_empty())?;
        if self.format.uses_old_ordering() {
            for entry in &entries {
                if entry.meta.is_dir() {
                    self.directory(entry, rel)?;
                } else {
                    self.file(entry)?;
                }
            }
        } else {
            for entry in entries.iter().filter(|e| !e.meta.is_dir()) {
                self.file(entry)?;
            }
            for entry in entries.iter().filter(|e| e.meta.is_dir()) {
                self.directory(entry, rel)?;
            }
        }
        Ok(())
    }

    fn directory(&mut self, entry: &Entry, parent_rel: &str) -> Result<(), StoreError> {
        let rel = format!("{parent_rel}/{}", entry.name);
        let mtime = if self.format.uses_old_ordering() {
            Some(mtime_of(&entry.meta, &entry.path)?)
        } else {
            None
        };
        self.nodes.push(ManifestNode::Directory {
            mtime,
            path: rel.clone(),
        });
        self.walk(&entry.path, &rel)
    }

    fn file(&mut self, entry: &Entry) -> Result<(), StoreError> {
        check_cancelled(self.progress)?;
        let file_type = entry.meta.file_type();
        let name = entry.name.clone();

        if file_type.is_symlink() {
            let target = fs::read_link(&entry.path).map_err(StoreError::fs_at("failed to read link", &entry.path))?;
            let data = link_bytes(&target);
            self.nodes.push(ManifestNode::Symlink {
                hash: self.format.digest_content(&data),
                size: data.len() as u64,
                name,
            });
            return Ok(());
        }
        if !file_type.is_file() {
            return Err(StoreError::UnsupportedEntry {
                path: entry.path.clone(),
            });
        }

        let hash = self.hash_file(&entry.path)?;
        let size = entry.meta.len();
        let node = if self.flags.symlink.contains(&entry.path) {
            ManifestNode::Symlink { hash, size, name }
        } else {
            let mtime = mtime_of(&entry.meta, &entry.path)?;
            if is_executable(&entry.meta) || self.flags.executable.contains(&entry.path) {
                ManifestNode::ExecutableFile { hash, mtime, size, name }
            } else {
                ManifestNode::File { hash, mtime, size, name }
            }
        };
        self.nodes.push(node);
        Ok(())
    }

    fn hash_file(&mut self, path: &Path) -> Result<String, StoreError> {
        let mut file = File::open(path).map_err(StoreError::fs_at("failed to open", path))?;
        let mut hasher = self.format.content_hasher();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StoreError::fs("failed to read", path, e)),
            };
            hasher.update(&buf[..n]);
            self.bytes_done += n as u64;
        }
        self.progress.report("hashing", self.bytes_done, None);
        Ok(hasher.finish_hex())
    }
}

/// List `dir` sorted byte-wise by name, skipping store bookkeeping files at the root.
fn read_sorted(dir: &Path, is_root: bool) -> Result<Vec<Entry>, StoreError> {
    let mut entries = Vec::new();
    for item in fs::read_dir(dir).map_err(StoreError::fs_at("failed to list", dir))? {
        let item = item.map_err(StoreError::fs_at("failed to list", dir))?;
        let path = item.path();
        let name = item
            .file_name()
            .into_string()
            .map_err(|_| StoreError::UnsupportedEntry { path: path.clone() })?;
        if name.contains('\n') {
            return Err(StoreError::UnsupportedEntry { path });
        }
        let meta = fs::symlink_metadata(&path).map_err(StoreError::fs_at("failed to inspect", &path))?;
        if is_root && !meta.is_dir() && [MANIFEST_FILE, XBIT_FILE, SYMLINK_FILE].contains(&name.as_str()) {
            continue;
        }
        entries.push(Entry { name, path, meta });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn mtime_of(meta: &fs::Metadata, path: &Path) -> Result<i64, StoreError> {
    let modified = meta.modified().map_err(|e| match e.kind() {
        io::ErrorKind::Unsupported => StoreError::UnstableTimestamp {
            path: path.to_path_buf(),
        },
        _ => StoreError::fs("failed to read modification time of", path, e),
    })?;
    Ok(unix_seconds(modified))
}

/// Whole seconds since the epoch, truncated toward negative infinity.
fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => {
            let before = e.duration();
            let secs = before.as_secs() as i64;
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn link_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().replace('\\', "/").into_bytes()
}

/// Probe whether `dir`'s filesystem records modification times to the second.
///
/// Writes a temporary file with an odd-second timestamp and reads it back.
/// A `PermissionDenied` failure is returned as a `FileSystem` error so that
/// callers can decide to treat the directory as read-only.
pub fn check_time_accuracy(dir: &Path) -> Result<(), StoreError> {
    let probe = dir.join(format!(".time-probe.{}", random_name()));
    let result = (|| -> Result<(), StoreError> {
        let file = File::create(&probe).map_err(StoreError::fs_at("failed to create", &probe))?;
        let expected = UNIX_EPOCH + Duration::from_secs(1_000_000_001);
        file.set_modified(expected).map_err(|e| match e.kind() {
            io::ErrorKind::Unsupported => StoreError::UnstableTimestamp {
                path: dir.to_path_buf(),
            },
            _ => StoreError::fs("failed to set modification time of", &probe, e),
        })?;
        drop(file);
        let actual = fs::metadata(&probe)
            .and_then(|m| m.modified())
            .map_err(StoreError::fs_at("failed to inspect", &probe))?;
        if unix_seconds(actual) == unix_seconds(expected) {
            Ok(())
        } else {
            Err(StoreError::UnstableTimestamp {
                path: dir.to_path_buf(),
            })
        }
    })();
    let _ = fs::remove_file(&probe);
    result
}
