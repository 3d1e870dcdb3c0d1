//! Fixed-output cache warming.
//!
//! After hashes land in the manifests, building each FOD sub-derivation
//! on the same machine lets the binary cache pick the result up, so
//! downstream builders get a cache hit instead of re-fetching (and, for
//! non-deterministic fetchers, re-hashing). Only the FOD is built; the
//! full package may need resources unavailable in the build sandbox.

use flakeup_events::EventSender;
use flakeup_nix::{nix_build_dry_run, store_realise};
use flakeup_types::{HashCollection, HashType, UpdateError};

use crate::context::{RunContext, current_nix_platform};
use crate::expr::overlay_attr_expr;
use crate::sources::load_source_entry;

/// A single FOD sub-derivation to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FodTarget {
    pub package: String,
    pub hash_type: HashType,
    pub fod_attr: &'static str,
}

/// Outcome of a cache-warming pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WarmSummary {
    pub built: Vec<String>,
    pub already_cached: Vec<String>,
    pub failed: Vec<String>,
}

fn fod_attr_for(hash_type: HashType) -> Option<&'static str> {
    match hash_type {
        HashType::NodeModulesHash => Some(".node_modules"),
        _ => None,
    }
}

pub(crate) fn find_fod_targets(
    ctx: &RunContext,
    system: &str,
) -> Result<(Vec<FodTarget>, Vec<String>), UpdateError> {
    let mut targets = Vec::new();
    let mut skipped = Vec::new();
    for (name, path) in ctx.paths.package_file_map("sources.json")? {
        let entry = load_source_entry(&path)?;
        let HashCollection::Entries(entries) = &entry.hashes else {
            continue;
        };
        for hash_entry in entries {
            if hash_entry.platform.as_deref() != Some(system) {
                continue;
            }
            match fod_attr_for(hash_entry.hash_type) {
                Some(fod_attr) => targets.push(FodTarget {
                    package: name.clone(),
                    hash_type: hash_entry.hash_type,
                    fod_attr,
                }),
                None => skipped.push(format!("{name} ({})", hash_entry.hash_type)),
            }
        }
    }
    Ok((targets, skipped))
}

/// Build every platform-tagged FOD sub-derivation for `system` (default:
/// the current platform) that the store does not already hold.
pub async fn warm_fod_cache(
    ctx: &RunContext,
    system: Option<String>,
    events: &EventSender,
) -> Result<WarmSummary, UpdateError> {
    let system = system.unwrap_or_else(current_nix_platform);
    let (targets, skipped) = find_fod_targets(ctx, &system)?;

    for entry in &skipped {
        events
            .status("warm-fod", format!("No FOD attribute mapping for {entry}, skipping"))
            .await;
    }
    if targets.is_empty() {
        events
            .status("warm-fod", format!("No FOD sub-derivations to build for {system}"))
            .await;
        return Ok(WarmSummary::default());
    }

    let mut summary = WarmSummary::default();
    for target in targets {
        let label = format!("{}{}", target.package, target.fod_attr);
        let expr = overlay_attr_expr(&ctx.paths, &target.package, target.fod_attr, Some(&system));

        let outcome = async {
            let drvs = nix_build_dry_run(&target.package, &expr, &ctx.config, events).await?;
            if drvs.is_empty() {
                return Ok(false);
            }
            let _permit = ctx.acquire_build_permit().await?;
            store_realise(&target.package, &drvs, &ctx.config, events).await?;
            Ok::<bool, UpdateError>(true)
        }
        .await;

        match outcome {
            Ok(true) => {
                events.status(&target.package, format!("Built {label}")).await;
                summary.built.push(label);
            }
            Ok(false) => {
                events
                    .status(&target.package, format!("{label} already cached"))
                    .await;
                summary.already_cached.push(label);
            }
            Err(err) => {
                events
                    .status(&target.package, format!("Failed to build {label}: {err}"))
                    .await;
                summary.failed.push(label);
            }
        }
    }
    Ok(summary)
}
