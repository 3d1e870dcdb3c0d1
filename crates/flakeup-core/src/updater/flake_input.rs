//! Hash-only updaters backed by flake inputs.
//!
//! These sources have no meaningful upstream version of their own; the
//! repo's lock file pins them, and staleness is decided by derivation
//! fingerprinting. Comparing version strings would miss nixpkgs bumps,
//! toolchain changes, and build-script edits; comparing the
//! sentinel-substituted `.drv` hash catches exactly what the build tool
//! itself would rebuild.

use async_trait::async_trait;
use tokio::sync::Mutex;

use flakeup_events::EventSender;
use flakeup_types::{HashCollection, HashEntry, HashType, SourceEntry, SourceHashes, UpdateError};

use crate::context::{RunContext, current_nix_platform};
use crate::strategies::{compute_deno_deps_hashes, compute_drv_fingerprint, compute_overlay_hash};
use crate::updater::{Updater, VersionInfo};

/// Which dependency resolver the overlay derivation vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlakeHashKind {
    GoVendor,
    CargoVendor,
    NpmDeps,
    BunNodeModules,
    DenoDeps,
}

impl FlakeHashKind {
    pub fn hash_type(&self) -> HashType {
        match self {
            FlakeHashKind::GoVendor => HashType::VendorHash,
            FlakeHashKind::CargoVendor => HashType::CargoHash,
            FlakeHashKind::NpmDeps => HashType::NpmDepsHash,
            FlakeHashKind::BunNodeModules => HashType::NodeModulesHash,
            FlakeHashKind::DenoDeps => HashType::DenoDepsHash,
        }
    }
}

/// Updater for a source whose hashes come from overlay evaluation and
/// whose staleness key is the derivation fingerprint.
pub struct FlakeInputHashUpdater {
    name: String,
    input: String,
    kind: FlakeHashKind,
    // Fingerprint computed by is_latest, reused by finalize_result for
    // the duration of one run.
    cached_fingerprint: Mutex<Option<String>>,
}

impl FlakeInputHashUpdater {
    /// `input` defaults to the package name when absent.
    pub fn new(name: impl Into<String>, input: Option<String>, kind: FlakeHashKind) -> Self {
        let name = name.into();
        let input = input.unwrap_or_else(|| name.clone());
        Self {
            name,
            input,
            kind,
            cached_fingerprint: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> FlakeHashKind {
        self.kind
    }
}

#[async_trait]
impl Updater for FlakeInputHashUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_name(&self) -> Option<&str> {
        Some(&self.input)
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        let node = ctx.input_node(&self.input)?;
        Ok(VersionInfo::new(node.version()))
    }

    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        Ok(SourceEntry::new(hashes)
            .with_version(&info.version)
            .with_input(&self.input))
    }

    /// Staleness via fingerprint comparison: up to date only when the
    /// sentinel-substituted `.drv` hash matches the stored one exactly.
    /// A computation failure conservatively reports stale.
    async fn is_latest(
        &self,
        current: Option<&SourceEntry>,
        _info: &VersionInfo,
        ctx: &RunContext,
    ) -> bool {
        let Some(stored) = current.and_then(|entry| entry.drv_hash.as_deref()) else {
            return false;
        };
        match compute_drv_fingerprint(&self.name, None, ctx).await {
            Ok(fingerprint) => {
                let matches = fingerprint == stored;
                *self.cached_fingerprint.lock().await = Some(fingerprint);
                matches
            }
            Err(_) => {
                *self.cached_fingerprint.lock().await = None;
                false
            }
        }
    }

    /// Attach the derivation fingerprint to the result entry. When the
    /// computation fails the entry is stored without one and the next
    /// run recomputes.
    async fn finalize_result(
        &self,
        result: SourceEntry,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceEntry, UpdateError> {
        events
            .status(&self.name, "Computing derivation fingerprint...")
            .await;
        let cached = self.cached_fingerprint.lock().await.clone();
        let fingerprint = match cached {
            Some(fingerprint) => Some(fingerprint),
            None => compute_drv_fingerprint(&self.name, None, ctx).await.ok(),
        };
        Ok(match fingerprint {
            Some(fingerprint) => result.with_drv_hash(fingerprint),
            None => result,
        })
    }

    async fn fetch_hashes(
        &self,
        _info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let hash_type = self.kind.hash_type();
        match self.kind {
            FlakeHashKind::GoVendor | FlakeHashKind::CargoVendor | FlakeHashKind::NpmDeps => {
                let digest = compute_overlay_hash(&self.name, &self.name, None, ctx, events).await?;
                Ok(HashCollection::Entries(vec![HashEntry::new(
                    hash_type, digest,
                )?]))
            }
            FlakeHashKind::BunNodeModules => {
                // node_modules trees differ per platform; emit only the
                // current platform's entry.
                let platform = current_nix_platform();
                let digest =
                    compute_overlay_hash(&self.name, &self.name, Some(&platform), ctx, events)
                        .await?;
                Ok(HashCollection::Entries(vec![
                    HashEntry::new(hash_type, digest)?.with_platform(platform),
                ]))
            }
            FlakeHashKind::DenoDeps => {
                let hashes = compute_deno_deps_hashes(
                    &self.name,
                    &self.input,
                    ctx.native_only(),
                    ctx,
                    events,
                )
                .await?;
                let entries = hashes
                    .into_iter()
                    .map(|(platform, digest)| {
                        Ok(HashEntry::new(hash_type, digest)?.with_platform(platform))
                    })
                    .collect::<Result<Vec<_>, UpdateError>>()?;
                Ok(HashCollection::Entries(entries))
            }
        }
    }
}
