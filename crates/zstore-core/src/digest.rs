//! # Digest Sets — Multi-Algorithm Implementation Identifiers
//!
//! An implementation is identified by the hash of its manifest. Because the
//! manifest format has evolved, the same implementation can carry several
//! identifiers at once (`sha256new_...`, `sha256=...`, `sha1new=...`). A
//! [`DigestSet`] bundles them and picks a canonical one for naming slots.
//!
//! ## Preference Ranking
//!
//! [`ManifestFormat`] is declared in preference order and derives `Ord`, so
//! iterating a `BTreeMap<ManifestFormat, _>` always yields the best algorithm
//! first. The order is: `sha256new`, `sha256`, `sha1new`, `sha1`.
//!
//! ## Encodings
//!
//! | Format      | Separator | Manifest digest       |
//! |-------------|-----------|-----------------------|
//! | `sha256new` | `_`       | Base32, 52 chars      |
//! | `sha256`    | `=`       | hex, 64 chars         |
//! | `sha1new`   | `=`       | hex, 40 chars         |
//! | `sha1`      | `=`       | hex, 40 chars         |

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Lowercase RFC 4648 Base32 alphabet used by `sha256new`.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A manifest format: the content hash algorithm, the line grammar and the
/// encoding of the final manifest digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    /// SHA-256, new ordering, Base32 digest with `_` separator.
    Sha256New,
    /// SHA-256, new ordering, hex digest.
    Sha256,
    /// SHA-1, new ordering, hex digest.
    Sha1New,
    /// SHA-1, old ordering. Still verified but never produced.
    Sha1,
}

impl ManifestFormat {
    /// Every supported format, best first.
    pub const ALL: [ManifestFormat; 4] = [Self::Sha256New, Self::Sha256, Self::Sha1New, Self::Sha1];

    /// Formats used when computing digests for new implementations, best first.
    pub const RECOMMENDED: [ManifestFormat; 3] = [Self::Sha256New, Self::Sha256, Self::Sha1New];

    /// The algorithm prefix (e.g. `sha256new`).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256New => "sha256new",
            Self::Sha256 => "sha256",
            Self::Sha1New => "sha1new",
            Self::Sha1 => "sha1",
        }
    }

    /// Separator between prefix and hash in digest ids and slot names.
    pub fn separator(&self) -> char {
        match self {
            Self::Sha256New => '_',
            _ => '=',
        }
    }

    /// Look up a format by its algorithm prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.prefix() == prefix)
    }

    /// Extract the format from the start of a digest id or slot name.
    ///
    /// Only the prefix is inspected; the hash part is not validated.
    pub fn from_id(id: &str) -> Option<Self> {
        let end = id.find(['_', '='])?;
        Self::from_prefix(&id[..end]).filter(|f| id[end..].starts_with(f.separator()))
    }

    /// `true` for the legacy format that merges files and directories in one sort.
    pub fn uses_old_ordering(&self) -> bool {
        matches!(self, Self::Sha1)
    }

    /// Render `hash` as a full digest id (`prefix<sep>hash`).
    pub fn id_for(&self, hash: &str) -> String {
        format!("{}{}{}", self.prefix(), self.separator(), hash)
    }

    /// Hash file or symlink content, rendering lowercase hex.
    pub fn digest_content(&self, data: &[u8]) -> String {
        let mut hasher = self.content_hasher();
        hasher.update(data);
        hasher.finish_hex()
    }

    /// Hash the serialized manifest, rendering it in this format's encoding.
    pub fn digest_manifest(&self, manifest_bytes: &[u8]) -> String {
        let mut hasher = self.content_hasher();
        hasher.update(manifest_bytes);
        let raw = hasher.finish();
        match self {
            Self::Sha256New => to_base32(&raw),
            _ => to_hex(&raw),
        }
    }

    /// Start an incremental content hash for this format.
    pub fn content_hasher(&self) -> ContentHasher {
        match self {
            Self::Sha256New | Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Sha1New | Self::Sha1 => ContentHasher::Sha1(Sha1::new()),
        }
    }

    /// `true` if `hash` has the exact length and alphabet of a manifest digest
    /// in this format.
    pub fn is_valid_hash(&self, hash: &str) -> bool {
        match self {
            Self::Sha256New => hash.len() == 52 && hash.bytes().all(|b| BASE32_ALPHABET.contains(&b)),
            Self::Sha256 => hash.len() == 64 && is_lower_hex(hash),
            Self::Sha1New | Self::Sha1 => hash.len() == 40 && is_lower_hex(hash),
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Incremental hasher over the algorithms used by manifest formats.
#[derive(Clone)]
pub enum ContentHasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-256 state.
    Sha256(Sha256),
}

impl ContentHasher {
    /// Feed bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finish and return the raw digest bytes.
    pub fn finish(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }

    /// Finish and return lowercase hex.
    pub fn finish_hex(self) -> String {
        to_hex(&self.finish())
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1(_) => f.write_str("ContentHasher::Sha1"),
            Self::Sha256(_) => f.write_str("ContentHasher::Sha256"),
        }
    }
}

/// Render bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render bytes as lowercase, unpadded RFC 4648 Base32.
pub fn to_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// One or more digests identifying the same implementation.
///
/// Every constructor guarantees at least one entry, so [`DigestSet::best`]
/// always has an answer. Values are validated against their format on entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DigestSet {
    entries: BTreeMap<ManifestFormat, String>,
}

impl DigestSet {
    /// A set holding a single validated digest.
    pub fn single(format: ManifestFormat, hash: impl Into<String>) -> Result<Self, StoreError> {
        let hash = hash.into();
        validate(format, &hash)?;
        Ok(Self {
            entries: BTreeMap::from([(format, hash)]),
        })
    }

    /// A set for a hash this crate computed itself, which is valid by construction.
    pub(crate) fn computed(format: ManifestFormat, hash: String) -> Self {
        Self {
            entries: BTreeMap::from([(format, hash)]),
        }
    }

    pub(crate) fn add_computed(&mut self, format: ManifestFormat, hash: String) {
        self.entries.insert(format, hash);
    }

    /// Build a set from caller-declared `(algorithm, hash)` pairs.
    ///
    /// Unknown algorithms are skipped. Fails if nothing usable remains or if
    /// a known algorithm carries a malformed hash.
    pub fn from_expected<I, A, H>(pairs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = (A, H)>,
        A: AsRef<str>,
        H: AsRef<str>,
    {
        let mut entries = BTreeMap::new();
        for (algorithm, hash) in pairs {
            let (algorithm, hash) = (algorithm.as_ref(), hash.as_ref());
            let Some(format) = ManifestFormat::from_prefix(algorithm) else {
                tracing::debug!(algorithm, "ignoring digest with unsupported algorithm");
                continue;
            };
            validate(format, hash)?;
            entries.insert(format, hash.to_string());
        }
        if entries.is_empty() {
            return Err(StoreError::InvalidDigest(
                "no digest with a supported algorithm was given".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    /// Parse a single digest id such as `sha256=<hex>`.
    pub fn from_id(id: &str) -> Result<Self, StoreError> {
        Self::parse_slot_name(id)
            .ok_or_else(|| StoreError::InvalidDigest(format!("'{id}' is not a recognised digest id")))
    }

    /// Interpret a directory name as a digest.
    ///
    /// Returns `None` for anything that is not exactly one valid encoding,
    /// which is how staging directories are told apart from slots.
    pub fn parse_slot_name(name: &str) -> Option<Self> {
        let format = ManifestFormat::from_id(name)?;
        let hash = &name[format.prefix().len() + 1..];
        format.is_valid_hash(hash).then(|| Self {
            entries: BTreeMap::from([(format, hash.to_string())]),
        })
    }

    /// Add another digest of the same implementation.
    pub fn insert(mut self, format: ManifestFormat, hash: impl Into<String>) -> Result<Self, StoreError> {
        let hash = hash.into();
        validate(format, &hash)?;
        self.entries.insert(format, hash);
        Ok(self)
    }

    /// The preferred `(format, hash)` pair.
    pub fn best(&self) -> (ManifestFormat, &str) {
        self.entries
            .iter()
            .next()
            .map(|(f, h)| (*f, h.as_str()))
            .unwrap_or((ManifestFormat::Sha256New, ""))
    }

    /// The preferred digest rendered as an id; this is the slot name to create.
    pub fn best_id(&self) -> String {
        let (format, hash) = self.best();
        format.id_for(hash)
    }

    /// The hash recorded for `format`, if any.
    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        self.entries.get(&format).map(String::as_str)
    }

    /// All `(format, hash)` pairs, best first.
    pub fn iter(&self) -> impl Iterator<Item = (ManifestFormat, &str)> {
        self.entries.iter().map(|(f, h)| (*f, h.as_str()))
    }

    /// Every encoding of this set as a slot name, best first.
    pub fn available_ids(&self) -> Vec<String> {
        self.iter().map(|(f, h)| f.id_for(h)).collect()
    }

    /// `true` if any encoding equals `on_disk_name`.
    pub fn matches_any(&self, on_disk_name: &str) -> bool {
        match Self::parse_slot_name(on_disk_name) {
            Some(other) => {
                let (format, hash) = other.best();
                self.get(format) == Some(hash)
            }
            None => false,
        }
    }

    /// `true` if the sets share at least one digest and disagree on none.
    pub fn partial_eq(&self, other: &DigestSet) -> bool {
        let mut shared = false;
        for (format, hash) in self.iter() {
            match other.get(format) {
                Some(theirs) if theirs == hash => shared = true,
                Some(_) => return false,
                None => {}
            }
        }
        shared
    }
}

impl fmt::Display for DigestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.available_ids().join(", "))
    }
}

fn validate(format: ManifestFormat, hash: &str) -> Result<(), StoreError> {
    if format.is_valid_hash(hash) {
        Ok(())
    } else {
        Err(StoreError::InvalidDigest(format!(
            "'{hash}' is not a valid {format} digest"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    #[test]
    fn ranking_is_declaration_order() {
        assert!(ManifestFormat::Sha256New < ManifestFormat::Sha256);
        assert!(ManifestFormat::Sha256 < ManifestFormat::Sha1New);
        assert!(ManifestFormat::Sha1New < ManifestFormat::Sha1);
        assert!(!ManifestFormat::RECOMMENDED.contains(&ManifestFormat::Sha1));
    }

    #[test]
    fn content_digest_known_vectors() {
        assert_eq!(ManifestFormat::Sha256.digest_content(b"hello"), SHA256);
        assert_eq!(ManifestFormat::Sha1New.digest_content(b"hello"), SHA1);
    }

    #[test]
    fn base32_matches_rfc4648_vectors() {
        assert_eq!(to_base32(b""), "");
        assert_eq!(to_base32(b"f"), "my");
        assert_eq!(to_base32(b"fo"), "mzxq");
        assert_eq!(to_base32(b"foo"), "mzxw6");
        assert_eq!(to_base32(b"foob"), "mzxw6yq");
        assert_eq!(to_base32(b"fooba"), "mzxw6ytb");
        assert_eq!(to_base32(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn sha256new_digest_is_52_chars() {
        let digest = ManifestFormat::Sha256New.digest_manifest(b"");
        assert_eq!(digest.len(), 52);
        assert!(ManifestFormat::Sha256New.is_valid_hash(&digest));
    }

    #[test]
    fn parse_slot_name_accepts_each_encoding() {
        let set = DigestSet::parse_slot_name(&format!("sha256={SHA256}")).unwrap();
        assert_eq!(set.best(), (ManifestFormat::Sha256, SHA256));

        let set = DigestSet::parse_slot_name(&format!("sha1new={SHA1}")).unwrap();
        assert_eq!(set.best().0, ManifestFormat::Sha1New);

        let b32 = ManifestFormat::Sha256New.digest_manifest(b"x");
        let set = DigestSet::parse_slot_name(&format!("sha256new_{b32}")).unwrap();
        assert_eq!(set.best(), (ManifestFormat::Sha256New, b32.as_str()));
    }

    #[test]
    fn parse_slot_name_rejects_non_digests() {
        assert!(DigestSet::parse_slot_name("abcdefgh.tmp").is_none());
        assert!(DigestSet::parse_slot_name("sha256=short").is_none());
        assert!(DigestSet::parse_slot_name(&format!("sha256_{SHA256}")).is_none());
        assert!(DigestSet::parse_slot_name(&format!("md5={SHA1}")).is_none());
        assert!(DigestSet::parse_slot_name(&format!("sha256={}", SHA256.to_uppercase())).is_none());
        assert!(DigestSet::parse_slot_name("").is_none());
    }

    #[test]
    fn from_expected_skips_unknown_algorithms() {
        let set = DigestSet::from_expected([("md5", "abc"), ("sha256", SHA256)]).unwrap();
        assert_eq!(set.available_ids(), vec![format!("sha256={SHA256}")]);
    }

    #[test]
    fn from_expected_requires_a_known_algorithm() {
        let err = DigestSet::from_expected([("md5", "abc")]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDigest(_)));
        let empty: [(&str, &str); 0] = [];
        assert!(DigestSet::from_expected(empty).is_err());
    }

    #[test]
    fn from_expected_rejects_malformed_hash() {
        let err = DigestSet::from_expected([("sha256", "nothex")]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDigest(_)));
    }

    #[test]
    fn best_prefers_newer_algorithms() {
        let set = DigestSet::from_expected([("sha1new", SHA1), ("sha256", SHA256)]).unwrap();
        assert_eq!(set.best().0, ManifestFormat::Sha256);
        assert_eq!(set.best_id(), format!("sha256={SHA256}"));
        assert_eq!(
            set.available_ids(),
            vec![format!("sha256={SHA256}"), format!("sha1new={SHA1}")]
        );
    }

    #[test]
    fn matches_any_checks_every_encoding() {
        let set = DigestSet::from_expected([("sha1new", SHA1), ("sha256", SHA256)]).unwrap();
        assert!(set.matches_any(&format!("sha1new={SHA1}")));
        assert!(set.matches_any(&format!("sha256={SHA256}")));
        assert!(!set.matches_any(&format!("sha1={SHA1}")));
        assert!(!set.matches_any("staging.dir"));
    }

    #[test]
    fn partial_eq_requires_overlap_without_conflict() {
        let a = DigestSet::from_expected([("sha1new", SHA1), ("sha256", SHA256)]).unwrap();
        let b = DigestSet::from_id(&format!("sha256={SHA256}")).unwrap();
        assert!(a.partial_eq(&b));

        let c = DigestSet::from_id(&format!("sha1={SHA1}")).unwrap();
        assert!(!a.partial_eq(&c));

        let zeros = "0".repeat(40);
        let conflicting = DigestSet::from_expected([("sha256", SHA256), ("sha1new", zeros.as_str())]).unwrap();
        assert!(!a.partial_eq(&conflicting));
    }

    #[test]
    fn display_joins_ids() {
        let set = DigestSet::from_expected([("sha1new", SHA1), ("sha256", SHA256)]).unwrap();
        assert_eq!(set.to_string(), format!("sha256={SHA256}, sha1new={SHA1}"));
    }

    #[test]
    fn serializes_as_map() {
        let set = DigestSet::single(ManifestFormat::Sha256, SHA256).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["sha256"], SHA256);
    }

    #[test]
    fn from_id_reports_invalid() {
        assert!(matches!(
            DigestSet::from_id("not-a-digest"),
            Err(StoreError::InvalidDigest(_))
        ));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Base32 output length is ceil(bits / 5) and uses only the alphabet.
        #[test]
        fn base32_length_and_alphabet(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let encoded = to_base32(&bytes);
            prop_assert_eq!(encoded.len(), (bytes.len() * 8).div_ceil(5));
            prop_assert!(encoded.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
        }

        /// Every manifest digest renders to a slot name that parses back to itself.
        #[test]
        fn slot_names_parse_back(data in prop::collection::vec(any::<u8>(), 0..128)) {
            for format in ManifestFormat::ALL {
                let id = format.id_for(&format.digest_manifest(&data));
                let set = DigestSet::parse_slot_name(&id);
                prop_assert!(set.is_some(), "{} did not parse", id);
                let set = set.unwrap();
                prop_assert_eq!(set.best_id(), id.clone());
                prop_assert!(set.matches_any(&id));
            }
        }

        /// Names without a separator are never slots.
        #[test]
        fn staging_like_names_never_parse(name in "[a-z0-9.]{0,40}") {
            prop_assert!(DigestSet::parse_slot_name(&name).is_none());
        }
    }
}
