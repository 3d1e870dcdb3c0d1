//! Hash algebra: algorithms, typed entries, and the two-shape collection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Hash algorithms the build tool can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// All algorithms, in the order they appear in SRI prefixes.
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::Blake3,
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(UpdateError::Validation(format!(
                "unknown hash algorithm: {other}"
            ))),
        }
    }
}

/// Check whether `value` is a well-formed SRI string (`<algo>-<base64>`).
pub fn is_sri(value: &str) -> bool {
    let Some((algo, digest)) = value.split_once('-') else {
        return false;
    };
    if HashAlgorithm::from_str(algo).is_err() {
        return false;
    }
    let trimmed = digest.trim_end_matches('=');
    !trimmed.is_empty()
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
        && digest[trimmed.len()..].bytes().all(|b| b == b'=')
}

/// Validate a digest against the on-disk manifest format (sha256 SRI only).
pub fn validate_sri_sha256(value: &str) -> Result<(), UpdateError> {
    if value.starts_with("sha256-") && is_sri(value) {
        Ok(())
    } else {
        Err(UpdateError::Validation(format!(
            "hash must be in SRI format (sha256-...): {value:?}"
        )))
    }
}

/// Default placeholder digest used when soliciting a real hash from the
/// build tool. Any digest equal to this sentinel is never persisted.
pub const DEFAULT_FAKE_HASH: &str = "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

static FAKE_HASH: LazyLock<String> = LazyLock::new(|| {
    std::env::var("UPDATE_FAKE_HASH").unwrap_or_else(|_| DEFAULT_FAKE_HASH.to_string())
});

/// The configured fake-hash sentinel (from `UPDATE_FAKE_HASH`, read once).
pub fn fake_hash_sentinel() -> &'static str {
    &FAKE_HASH
}

/// Role a hash plays inside a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashType {
    #[serde(rename = "cargoHash")]
    CargoHash,
    #[serde(rename = "denoDepsHash")]
    DenoDepsHash,
    #[serde(rename = "nodeModulesHash")]
    NodeModulesHash,
    #[serde(rename = "npmDepsHash")]
    NpmDepsHash,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "srcHash")]
    SrcHash,
    #[serde(rename = "spectaOutputHash")]
    SpectaOutputHash,
    #[serde(rename = "tauriOutputHash")]
    TauriOutputHash,
    #[serde(rename = "tauriSpectaOutputHash")]
    TauriSpectaOutputHash,
    #[serde(rename = "uvLockHash")]
    UvLockHash,
    #[serde(rename = "vendorHash")]
    VendorHash,
}

impl HashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::CargoHash => "cargoHash",
            HashType::DenoDepsHash => "denoDepsHash",
            HashType::NodeModulesHash => "nodeModulesHash",
            HashType::NpmDepsHash => "npmDepsHash",
            HashType::Sha256 => "sha256",
            HashType::SrcHash => "srcHash",
            HashType::SpectaOutputHash => "spectaOutputHash",
            HashType::TauriOutputHash => "tauriOutputHash",
            HashType::TauriSpectaOutputHash => "tauriSpectaOutputHash",
            HashType::UvLockHash => "uvLockHash",
            HashType::VendorHash => "vendorHash",
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashType {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| UpdateError::Validation(format!("unknown hash type: {s}")))
    }
}

/// A single structured hash entry in `sources.json`.
///
/// Fields are declared in lexicographic serialization order so the on-disk
/// object keys come out sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashEntry {
    #[serde(rename = "gitDep", skip_serializing_if = "Option::is_none")]
    pub git_dep: Option<String>,
    pub hash: String,
    #[serde(rename = "hashType")]
    pub hash_type: HashType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<BTreeMap<String, String>>,
}

impl HashEntry {
    /// Build a validated hash entry from a type and an SRI digest.
    pub fn new(hash_type: HashType, hash: impl Into<String>) -> Result<Self, UpdateError> {
        let hash = hash.into();
        validate_sri_sha256(&hash)?;
        Ok(Self {
            git_dep: None,
            hash,
            hash_type,
            platform: None,
            url: None,
            urls: None,
        })
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_urls(mut self, urls: BTreeMap<String, String>) -> Self {
        self.urls = Some(urls);
        self
    }

    pub fn with_git_dep(mut self, git_dep: impl Into<String>) -> Self {
        self.git_dep = Some(git_dep.into());
        self
    }

    /// Re-check model constraints after deserialization.
    pub fn validate(&self) -> Result<(), UpdateError> {
        validate_sri_sha256(&self.hash)
    }

    fn merge_key(&self) -> MergeKey {
        (
            self.hash_type,
            self.platform.clone(),
            self.git_dep.clone(),
            self.url.clone(),
            self.urls.clone(),
        )
    }
}

type MergeKey = (
    HashType,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<BTreeMap<String, String>>,
);

/// Hashes as plain values: either tagged entries or a platform map.
pub type SourceHashes = HashCollection;

/// Either a list of tagged hash entries or a platform-to-digest mapping.
///
/// A collection uses exactly one shape; merging a list with a map is a
/// hard error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HashCollection {
    Entries(Vec<HashEntry>),
    Mapping(BTreeMap<String, String>),
}

impl HashCollection {
    pub fn entries(&self) -> Option<&[HashEntry]> {
        match self {
            HashCollection::Entries(entries) => Some(entries),
            HashCollection::Mapping(_) => None,
        }
    }

    pub fn mapping(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            HashCollection::Entries(_) => None,
            HashCollection::Mapping(mapping) => Some(mapping),
        }
    }

    /// Return the single effective hash when one can be inferred.
    pub fn primary_hash(&self) -> Option<&str> {
        match self {
            HashCollection::Entries(entries) => match entries.as_slice() {
                [only] => Some(&only.hash),
                _ => None,
            },
            HashCollection::Mapping(mapping) => {
                let mut values = mapping.values();
                let first = values.next()?;
                values.all(|v| v == first).then_some(first.as_str())
            }
        }
    }

    /// Re-check model constraints after deserialization.
    pub fn validate(&self) -> Result<(), UpdateError> {
        match self {
            HashCollection::Entries(entries) => {
                for entry in entries {
                    entry.validate()?;
                }
            }
            HashCollection::Mapping(mapping) => {
                for value in mapping.values() {
                    validate_sri_sha256(value)?;
                }
            }
        }
        Ok(())
    }

    /// Merge `other` into this collection.
    ///
    /// Entries deduplicate by (type, platform, gitDep, url, urls); the last
    /// non-sentinel occurrence wins and sentinel digests are dropped.
    /// Mappings merge per platform with the same rules. Mixing the two
    /// shapes is an error.
    pub fn merge(&self, other: &HashCollection) -> Result<HashCollection, UpdateError> {
        let sentinel = fake_hash_sentinel();
        match (self, other) {
            (HashCollection::Entries(ours), HashCollection::Entries(theirs)) => {
                // Insertion-ordered dedup: the lists are small, so a linear
                // key scan beats pulling in an ordered map.
                let mut merged: Vec<(MergeKey, HashEntry)> = Vec::new();
                for entry in ours.iter().chain(theirs) {
                    if entry.hash.starts_with(sentinel) {
                        continue;
                    }
                    let key = entry.merge_key();
                    match merged.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, slot)) => *slot = entry.clone(),
                        None => merged.push((key, entry.clone())),
                    }
                }
                Ok(HashCollection::Entries(
                    merged.into_iter().map(|(_, entry)| entry).collect(),
                ))
            }
            (HashCollection::Mapping(ours), HashCollection::Mapping(theirs)) => {
                let mut merged = BTreeMap::new();
                for (platform, hash) in ours.iter().chain(theirs) {
                    if hash.starts_with(sentinel) {
                        continue;
                    }
                    merged.insert(platform.clone(), hash.clone());
                }
                Ok(HashCollection::Mapping(merged))
            }
            _ => Err(UpdateError::Validation(
                "cannot merge hash entries with hash mapping".to_string(),
            )),
        }
    }
}
