//! Per-package source entries and the in-memory aggregate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::hash::HashCollection;

/// A package source entry: hashes plus upstream metadata.
///
/// Fields are declared in lexicographic serialization order so the on-disk
/// object keys come out sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(rename = "drvHash", skip_serializing_if = "Option::is_none")]
    pub drv_hash: Option<String>,
    pub hashes: HashCollection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceEntry {
    pub fn new(hashes: HashCollection) -> Self {
        Self {
            commit: None,
            drv_hash: None,
            hashes,
            input: None,
            urls: None,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_urls(mut self, urls: BTreeMap<String, String>) -> Self {
        self.urls = Some(urls);
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_drv_hash(mut self, drv_hash: impl Into<String>) -> Self {
        self.drv_hash = Some(drv_hash.into());
        self
    }

    /// Re-check model constraints after deserialization.
    pub fn validate(&self) -> Result<(), UpdateError> {
        self.hashes.validate()?;
        if let Some(commit) = &self.commit {
            let ok = commit.len() == 40
                && commit
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            if !ok {
                return Err(UpdateError::Validation(format!(
                    "commit must be a 40-hex git revision: {commit:?}"
                )));
            }
        }
        Ok(())
    }

    /// Merge `other` into this entry: other's scalar fields shadow ours,
    /// hash collections merge, URL maps union.
    pub fn merge(&self, other: &SourceEntry) -> Result<SourceEntry, UpdateError> {
        let hashes = self.hashes.merge(&other.hashes)?;
        let urls = match (&self.urls, &other.urls) {
            (None, None) => None,
            (ours, theirs) => {
                let mut merged = ours.clone().unwrap_or_default();
                merged.extend(theirs.clone().unwrap_or_default());
                Some(merged)
            }
        };
        Ok(SourceEntry {
            commit: other.commit.clone().or_else(|| self.commit.clone()),
            drv_hash: other.drv_hash.clone().or_else(|| self.drv_hash.clone()),
            hashes,
            input: other.input.clone().or_else(|| self.input.clone()),
            urls,
            version: other.version.clone().or_else(|| self.version.clone()),
        })
    }
}

/// The in-memory aggregate of every per-package `sources.json`.
///
/// The aggregate never exists on disk as a single file; persistence is
/// per package directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcesFile {
    pub entries: BTreeMap<String, SourceEntry>,
}

impl SourcesFile {
    pub fn new(entries: BTreeMap<String, SourceEntry>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&SourceEntry> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: SourceEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Union of entries, merging per entry where names collide.
    pub fn merge(&self, other: &SourcesFile) -> Result<SourcesFile, UpdateError> {
        let mut merged = self.entries.clone();
        for (name, entry) in &other.entries {
            let next = match merged.get(name) {
                Some(existing) => existing.merge(entry)?,
                None => entry.clone(),
            };
            merged.insert(name.clone(), next);
        }
        Ok(SourcesFile { entries: merged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashEntry, HashType};

    const DIGEST_A: &str = "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=";
    const DIGEST_B: &str = "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=";

    fn entry_with_version(version: &str, digest: &str) -> SourceEntry {
        SourceEntry::new(HashCollection::Entries(vec![
            HashEntry::new(HashType::VendorHash, digest).unwrap(),
        ]))
        .with_version(version)
    }

    #[test]
    fn serializes_with_sorted_keys() {
        let entry = entry_with_version("1.0.0", DIGEST_A)
            .with_input("upstream")
            .with_drv_hash("abc123");
        let json = serde_json::to_string(&entry).unwrap();
        let drv = json.find("drvHash").unwrap();
        let hashes = json.find("hashes").unwrap();
        let input = json.find("input").unwrap();
        let version = json.find("version").unwrap();
        assert!(drv < hashes && hashes < input && input < version);
    }

    #[test]
    fn roundtrips_through_json() {
        let entry = entry_with_version("2.1.0", DIGEST_A)
            .with_commit("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .with_urls(BTreeMap::from([(
                "x86_64-linux".to_string(),
                "https://example.com/pkg.tar.gz".to_string(),
            )]));
        let json = serde_json::to_string_pretty(&entry).unwrap();
        let parsed: SourceEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
        parsed.validate().unwrap();
    }

    #[test]
    fn validate_rejects_short_commit() {
        let entry = entry_with_version("1.0.0", DIGEST_A).with_commit("deadbeef");
        assert!(entry.validate().is_err());
    }

    #[test]
    fn validate_rejects_uppercase_commit() {
        let entry = entry_with_version("1.0.0", DIGEST_A).with_commit("A".repeat(40));
        assert!(entry.validate().is_err());
    }

    #[test]
    fn merge_prefers_other_scalars_and_keeps_own_fallbacks() {
        let ours = entry_with_version("1.0.0", DIGEST_A).with_input("upstream");
        let theirs = entry_with_version("1.1.0", DIGEST_B);
        let merged = ours.merge(&theirs).unwrap();
        assert_eq!(merged.version.as_deref(), Some("1.1.0"));
        assert_eq!(merged.input.as_deref(), Some("upstream"));
        assert_eq!(merged.hashes.primary_hash(), Some(DIGEST_B));
    }

    #[test]
    fn merge_unions_url_maps() {
        let ours = entry_with_version("1.0.0", DIGEST_A).with_urls(BTreeMap::from([(
            "x86_64-linux".to_string(),
            "https://old".to_string(),
        )]));
        let theirs = entry_with_version("1.0.0", DIGEST_A).with_urls(BTreeMap::from([(
            "aarch64-darwin".to_string(),
            "https://new".to_string(),
        )]));
        let merged = ours.merge(&theirs).unwrap();
        assert_eq!(merged.urls.unwrap().len(), 2);
    }

    #[test]
    fn sources_file_merge_is_per_entry() {
        let mut left = SourcesFile::default();
        left.insert("pkg-a", entry_with_version("1.0.0", DIGEST_A));
        let mut right = SourcesFile::default();
        right.insert("pkg-a", entry_with_version("1.1.0", DIGEST_B));
        right.insert("pkg-b", entry_with_version("0.3.0", DIGEST_B));

        let merged = left.merge(&right).unwrap();
        assert_eq!(merged.entries.len(), 2);
        assert_eq!(
            merged.get("pkg-a").unwrap().version.as_deref(),
            Some("1.1.0")
        );
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        const DIGESTS: [&str; 3] = [
            "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=",
            "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=",
            "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        ];
        const PLATFORMS: [&str; 3] = ["aarch64-darwin", "aarch64-linux", "x86_64-linux"];

        fn digest_strategy() -> impl Strategy<Value = String> {
            prop::sample::select(DIGESTS.to_vec()).prop_map(str::to_string)
        }

        fn mapping_strategy() -> impl Strategy<Value = HashCollection> {
            prop::collection::btree_map(
                prop::sample::select(PLATFORMS.to_vec()).prop_map(str::to_string),
                digest_strategy(),
                0..3,
            )
            .prop_map(HashCollection::Mapping)
        }

        fn entries_strategy() -> impl Strategy<Value = HashCollection> {
            prop::collection::vec(
                (
                    prop::sample::select(vec![
                        HashType::VendorHash,
                        HashType::CargoHash,
                        HashType::DenoDepsHash,
                    ]),
                    digest_strategy(),
                    prop::option::of(
                        prop::sample::select(PLATFORMS.to_vec()).prop_map(str::to_string),
                    ),
                ),
                0..4,
            )
            .prop_map(|specs| {
                HashCollection::Entries(
                    specs
                        .into_iter()
                        .map(|(ty, digest, platform)| {
                            let mut entry = HashEntry::new(ty, digest).unwrap();
                            entry.platform = platform;
                            entry
                        })
                        .collect(),
                )
            })
        }

        fn entry_strategy() -> impl Strategy<Value = SourceEntry> {
            (
                prop_oneof![mapping_strategy(), entries_strategy()],
                prop::option::of("[0-9]\\.[0-9]\\.[0-9]"),
            )
                .prop_map(|(hashes, version)| {
                    let mut entry = SourceEntry::new(hashes);
                    entry.version = version;
                    entry
                })
        }

        fn same_shape(a: &SourceEntry, b: &SourceEntry) -> bool {
            matches!(
                (&a.hashes, &b.hashes),
                (HashCollection::Entries(_), HashCollection::Entries(_))
                    | (HashCollection::Mapping(_), HashCollection::Mapping(_))
            )
        }

        proptest! {
            /// Property: merge is associative for same-shape collections.
            #[test]
            fn merge_associative(
                a in entry_strategy(),
                b in entry_strategy(),
                c in entry_strategy(),
            ) {
                prop_assume!(same_shape(&a, &b) && same_shape(&b, &c));
                let left = a.merge(&b).unwrap().merge(&c).unwrap();
                let right = a.merge(&b.merge(&c).unwrap()).unwrap();
                prop_assert_eq!(left, right);
            }

            /// Property: merging a non-sentinel entry with itself is the identity.
            #[test]
            fn merge_idempotent(a in entry_strategy()) {
                let once = a.merge(&a).unwrap();
                let twice = once.merge(&once).unwrap();
                prop_assert_eq!(once, twice);
            }

            /// Property: every field present in `other` wins in the merge.
            #[test]
            fn merge_prefers_other_fields(a in entry_strategy(), b in entry_strategy()) {
                prop_assume!(same_shape(&a, &b));
                let merged = a.merge(&b).unwrap();
                if b.version.is_some() {
                    prop_assert_eq!(merged.version, b.version);
                } else {
                    prop_assert_eq!(merged.version, a.version);
                }
            }
        }
    }
}
