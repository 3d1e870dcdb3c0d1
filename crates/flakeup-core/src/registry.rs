//! Per-package updater registry and declarative discovery.
//!
//! Every package directory may carry an `updater.toml` describing its
//! updater shape; startup scans `packages/*` and `overlays/*` once and
//! populates the registry. Built-in kinds are constructed directly from
//! the manifest — there is no import-time magic, and readers after
//! startup see an immutable snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use flakeup_types::{HashType, UpdateError};

use crate::paths::RepoPaths;
use crate::strategies::CargoLockGitDep;
use crate::updater::{
    CargoLockGitDepsUpdater, ChecksumProvidedUpdater, DownloadHashUpdater, FixedOutputPairUpdater,
    FlakeHashKind, FlakeInputHashUpdater, GithubRawFileUpdater, PlatformApiUpdater, Updater,
    VersionProbe,
};

/// One declared git dependency in a `cargo-lock-git-deps` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitDepSpec {
    pub name: String,
    #[serde(rename = "hash-type")]
    pub hash_type: HashType,
    #[serde(rename = "match")]
    pub match_name: String,
}

/// The declarative shape of a per-package `updater.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum UpdaterManifest {
    GoVendor {
        #[serde(default)]
        input: Option<String>,
    },
    CargoVendor {
        #[serde(default)]
        input: Option<String>,
    },
    NpmDeps {
        #[serde(default)]
        input: Option<String>,
    },
    BunNodeModules {
        #[serde(default)]
        input: Option<String>,
    },
    DenoDeps {
        #[serde(default)]
        input: Option<String>,
    },
    GithubRawFile {
        owner: String,
        repo: String,
        path: String,
    },
    CargoLockGitDeps {
        #[serde(default)]
        input: Option<String>,
        lockfile_path: String,
        git_deps: Vec<GitDepSpec>,
    },
    FixedOutputPair {
        owner: String,
        repo: String,
        #[serde(default)]
        post_fetch: Option<String>,
    },
    DownloadHash {
        version: VersionProbe,
        platforms: BTreeMap<String, String>,
    },
    ChecksumProvided {
        version: VersionProbe,
        platforms: BTreeMap<String, String>,
        checksum_url: String,
    },
    PlatformApi {
        endpoint: String,
        platforms: BTreeMap<String, String>,
        version_pointer: String,
        #[serde(default)]
        commit_pointer: Option<String>,
        #[serde(default)]
        checksum_pointer: Option<String>,
        url_pointer: String,
    },
}

impl UpdaterManifest {
    /// Construct the concrete updater for package `name`.
    pub fn build(self, name: &str) -> Arc<dyn Updater> {
        match self {
            UpdaterManifest::GoVendor { input } => {
                Arc::new(FlakeInputHashUpdater::new(name, input, FlakeHashKind::GoVendor))
            }
            UpdaterManifest::CargoVendor { input } => Arc::new(FlakeInputHashUpdater::new(
                name,
                input,
                FlakeHashKind::CargoVendor,
            )),
            UpdaterManifest::NpmDeps { input } => {
                Arc::new(FlakeInputHashUpdater::new(name, input, FlakeHashKind::NpmDeps))
            }
            UpdaterManifest::BunNodeModules { input } => Arc::new(FlakeInputHashUpdater::new(
                name,
                input,
                FlakeHashKind::BunNodeModules,
            )),
            UpdaterManifest::DenoDeps { input } => {
                Arc::new(FlakeInputHashUpdater::new(name, input, FlakeHashKind::DenoDeps))
            }
            UpdaterManifest::GithubRawFile { owner, repo, path } => {
                Arc::new(GithubRawFileUpdater::new(name, owner, repo, path))
            }
            UpdaterManifest::CargoLockGitDeps {
                input,
                lockfile_path,
                git_deps,
            } => {
                let input = input.unwrap_or_else(|| name.to_string());
                let deps = git_deps
                    .into_iter()
                    .map(|spec| CargoLockGitDep {
                        git_dep: spec.name,
                        hash_type: spec.hash_type,
                        match_name: spec.match_name,
                    })
                    .collect();
                Arc::new(CargoLockGitDepsUpdater::new(name, input, lockfile_path, deps))
            }
            UpdaterManifest::FixedOutputPair {
                owner,
                repo,
                post_fetch,
            } => Arc::new(FixedOutputPairUpdater::new(name, owner, repo, post_fetch)),
            UpdaterManifest::DownloadHash { version, platforms } => {
                Arc::new(DownloadHashUpdater::new(name, version, platforms))
            }
            UpdaterManifest::ChecksumProvided {
                version,
                platforms,
                checksum_url,
            } => Arc::new(ChecksumProvidedUpdater::new(
                name,
                version,
                platforms,
                checksum_url,
            )),
            UpdaterManifest::PlatformApi {
                endpoint,
                platforms,
                version_pointer,
                commit_pointer,
                checksum_pointer,
                url_pointer,
            } => Arc::new(PlatformApiUpdater::new(
                name,
                endpoint,
                platforms,
                version_pointer,
                commit_pointer,
                checksum_pointer,
                url_pointer,
            )),
        }
    }
}

/// Process-wide map from package name to its updater, populated once at
/// startup.
#[derive(Default)]
pub struct UpdaterRegistry {
    map: BTreeMap<String, Arc<dyn Updater>>,
}

impl std::fmt::Debug for UpdaterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdaterRegistry")
            .field("names", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UpdaterRegistry {
    /// Register an updater under its own name.
    pub fn register(&mut self, updater: Arc<dyn Updater>) {
        self.map.insert(updater.name().to_string(), updater);
    }

    /// Scan the package directories and build the registry from each
    /// `updater.toml` found.
    pub fn discover(paths: &RepoPaths) -> Result<Self, UpdateError> {
        let mut registry = Self::default();
        for (name, path) in paths.package_file_map("updater.toml")? {
            let text = std::fs::read_to_string(&path).map_err(|err| {
                UpdateError::Validation(format!("failed to read {}: {err}", path.display()))
            })?;
            let manifest: UpdaterManifest = toml::from_str(&text).map_err(|err| {
                UpdateError::Validation(format!("invalid updater manifest {}: {err}", path.display()))
            })?;
            registry.register(manifest.build(&name));
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Updater>> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Updater>)> {
        self.map.iter().map(|(name, updater)| (name.as_str(), updater))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
