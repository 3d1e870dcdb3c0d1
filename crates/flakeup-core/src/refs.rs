//! Ref updates for flake inputs pinned to version tags.
//!
//! Parallel to hash updates: inputs whose pinned ref looks like a
//! version tag are checked against the forge's releases (then tags) and
//! rewritten through the flake editor plus a lock update, both under a
//! single-writer lock since they mutate the flake files.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;

use flakeup_events::{EventPayload, EventSender, UpdateEvent, run_source_task};
use flakeup_flake_lock::{FlakeLock, InputRef};
use flakeup_nix::flake_lock_update;
use flakeup_process::{CommandSpec, stream_command};
use flakeup_types::UpdateError;

use crate::context::RunContext;

const BRANCH_REFS: [&str; 5] = [
    "master",
    "main",
    "nixos-unstable",
    "nixos-stable",
    "nixpkgs-unstable",
];

const MIN_COMMIT_HEX_LEN: usize = 7;

static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]+$").unwrap());
static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*?)\d").unwrap());

fn flake_edit_program() -> String {
    std::env::var("FLAKEUP_FLAKE_EDIT_BIN").unwrap_or_else(|_| "flake-edit".to_string())
}

/// Whether a pinned ref tracks a version tag: it contains a digit, is
/// not a known branch name, and is not a bare commit hash.
pub fn is_version_ref(reference: &str) -> bool {
    if BRANCH_REFS.contains(&reference) {
        return false;
    }
    if reference.starts_with("nixos-") || reference.starts_with("nixpkgs-") {
        return false;
    }
    if reference.len() >= MIN_COMMIT_HEX_LEN && HEX_RE.is_match(reference) {
        return false;
    }
    reference.chars().any(|c| c.is_ascii_digit())
}

/// A flake input eligible for tag tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlakeInputRef {
    pub name: String,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub input_type: String,
}

/// Collect root inputs whose original ref looks like a version tag.
pub fn get_flake_inputs_with_refs(lock: &FlakeLock) -> Vec<FlakeInputRef> {
    let Some(inputs) = &lock.root_node().inputs else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for (input_name, target) in inputs {
        let InputRef::Direct(node_name) = target else {
            continue;
        };
        let Some(node) = lock.nodes.get(node_name) else {
            continue;
        };
        let Some(original) = &node.original else {
            continue;
        };
        let Some(reference) = &original.r#ref else {
            continue;
        };
        if !is_version_ref(reference) {
            continue;
        }
        if let (Some(owner), Some(repo)) = (&original.owner, &original.repo)
            && matches!(original.ref_type.as_str(), "github" | "gitlab")
        {
            result.push(FlakeInputRef {
                name: input_name.clone(),
                owner: owner.clone(),
                repo: repo.clone(),
                reference: reference.clone(),
                input_type: original.ref_type.clone(),
            });
        }
    }
    result
}

/// The textual prefix before the first digit of a ref (`"v"` for
/// `v1.2.3`, `"release-"` for `release-4`).
pub fn extract_version_prefix(reference: &str) -> String {
    PREFIX_RE
        .captures(reference)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}

/// Candidate prefixes to try, collapsing a trailing lowercase `v` and
/// treating a bare `v` as either `v` or the empty prefix.
fn build_version_prefixes(prefix: &str) -> Vec<String> {
    let mut prefixes = vec![prefix.to_string()];
    let lowered = prefix.to_lowercase();
    if lowered.ends_with('v') && lowered != "v" {
        prefixes.push("v".to_string());
    }
    if lowered == "v" {
        prefixes.push(String::new());
    }
    prefixes.dedup();
    prefixes
}

fn tag_matches_prefix(tag: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        tag.starts_with(|c: char| c.is_ascii_digit())
    } else {
        tag.starts_with(prefix)
    }
}

fn select_tag<'a, I: IntoIterator<Item = &'a str>>(tags: I, prefix: &str) -> Option<String> {
    tags.into_iter()
        .find(|tag| tag_matches_prefix(tag, prefix))
        .map(str::to_string)
}

fn select_tag_from_releases(releases: &[serde_json::Value], prefix: &str) -> Option<String> {
    select_tag(
        releases
            .iter()
            .filter(|release| {
                !release["draft"].as_bool().unwrap_or(false)
                    && !release["prerelease"].as_bool().unwrap_or(false)
            })
            .filter_map(|release| release["tag_name"].as_str()),
        prefix,
    )
}

fn select_tag_from_tags(tags: &[serde_json::Value], prefix: &str) -> Option<String> {
    select_tag(tags.iter().filter_map(|tag| tag["name"].as_str()), prefix)
}

/// Find the latest matching tag: releases first (drafts and prereleases
/// filtered), then the tags endpoint.
///
/// External invariant: both endpoints return entries newest-first, so
/// the first matching tag is the latest. The tags endpoint has no
/// commit-date information to verify this against.
pub async fn fetch_github_latest_version_ref(
    ctx: &RunContext,
    owner: &str,
    repo: &str,
    prefix: &str,
) -> Option<String> {
    for candidate in build_version_prefixes(prefix) {
        if let Ok(releases) = ctx.forge.releases(owner, repo, 20).await
            && let Some(tag) = select_tag_from_releases(&releases, &candidate)
        {
            return Some(tag);
        }
        if let Ok(tags) = ctx.forge.tags(owner, repo, 30).await
            && let Some(tag) = select_tag_from_tags(&tags, &candidate)
        {
            return Some(tag);
        }
    }
    None
}

/// Outcome of a ref check for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdateResult {
    pub name: String,
    pub current_ref: String,
    pub latest_ref: Option<String>,
    pub error: Option<String>,
}

pub async fn check_flake_ref_update(input_ref: &FlakeInputRef, ctx: &RunContext) -> RefUpdateResult {
    if input_ref.input_type != "github" {
        return RefUpdateResult {
            name: input_ref.name.clone(),
            current_ref: input_ref.reference.clone(),
            latest_ref: None,
            error: Some(format!("Unsupported input type: {}", input_ref.input_type)),
        };
    }

    let prefix = extract_version_prefix(&input_ref.reference);
    let latest =
        fetch_github_latest_version_ref(ctx, &input_ref.owner, &input_ref.repo, &prefix).await;
    match latest {
        Some(latest) => RefUpdateResult {
            name: input_ref.name.clone(),
            current_ref: input_ref.reference.clone(),
            latest_ref: Some(latest),
            error: None,
        },
        None => RefUpdateResult {
            name: input_ref.name.clone(),
            current_ref: input_ref.reference.clone(),
            latest_ref: None,
            error: Some("Could not determine latest version".to_string()),
        },
    }
}

/// Rewrite the flake input to `new_ref` and refresh its lock entry.
pub async fn update_flake_ref(
    input_ref: &FlakeInputRef,
    new_ref: &str,
    source: &str,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<(), UpdateError> {
    events
        .status(
            source,
            format!("Updating ref: {} -> {new_ref}", input_ref.reference),
        )
        .await;

    let new_url = match input_ref.input_type.as_str() {
        "github" => format!("github:{}/{}/{new_ref}", input_ref.owner, input_ref.repo),
        "gitlab" => format!("gitlab:{}/{}/{new_ref}", input_ref.owner, input_ref.repo),
        other => {
            return Err(UpdateError::message(format!(
                "Unsupported input type: {other}"
            )));
        }
    };

    let change = stream_command(
        CommandSpec::new([
            flake_edit_program(),
            "change".to_string(),
            input_ref.name.clone(),
            new_url,
        ]),
        source,
        &ctx.config,
        events,
    )
    .await?;
    change.ensure_success()?;

    flake_lock_update(source, &input_ref.name, &ctx.config, events).await?;
    ctx.invalidate_flake_lock();
    Ok(())
}

/// Phase-1 task: check one input's pinned ref and rewrite it when a
/// newer tag exists. The rewrite runs under `flake_edit_lock`, the
/// single-writer lock shared by everything that mutates the flake files.
pub async fn update_refs_task(
    input_ref: FlakeInputRef,
    ctx: Arc<RunContext>,
    events: EventSender,
    dry_run: bool,
    flake_edit_lock: Arc<Mutex<()>>,
) {
    let source = input_ref.name.clone();
    let task = async {
        events
            .status(
                &source,
                format!(
                    "Checking {}/{} (current: {})",
                    input_ref.owner, input_ref.repo, input_ref.reference
                ),
            )
            .await;

        let result = check_flake_ref_update(&input_ref, &ctx).await;
        if let Some(error) = result.error {
            events.send(UpdateEvent::error(&source, error)).await;
            return Ok(());
        }
        let Some(latest) = result.latest_ref else {
            events
                .send(UpdateEvent::error(&source, "Missing latest ref"))
                .await;
            return Ok(());
        };

        if latest == result.current_ref {
            events
                .status(&source, format!("Up to date (ref: {})", result.current_ref))
                .await;
            events.result(&source, None).await;
            return Ok(());
        }

        let payload = EventPayload::RefUpdate {
            current: result.current_ref.clone(),
            latest: latest.clone(),
        };
        if dry_run {
            events
                .status(
                    &source,
                    format!("Update available: {} -> {latest}", result.current_ref),
                )
                .await;
            events.result(&source, Some(payload)).await;
            return Ok(());
        }

        {
            let _writer = flake_edit_lock.lock().await;
            update_flake_ref(&input_ref, &latest, &source, &ctx, &events).await?;
        }
        events.result(&source, Some(payload)).await;
        Ok(())
    };
    run_source_task(&source, &events, task).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_refs_are_recognized() {
        assert!(is_version_ref("v1.2.3"));
        assert!(is_version_ref("release-4"));
        assert!(is_version_ref("0.11.0"));
        assert!(!is_version_ref("main"));
        assert!(!is_version_ref("master"));
        assert!(!is_version_ref("nixos-unstable"));
        assert!(!is_version_ref("nixpkgs-24.05"));
        assert!(!is_version_ref("deadbeefcafe"));
        assert!(!is_version_ref("feature-branch"));
    }

    #[test]
    fn short_hex_strings_still_count_as_versions() {
        // Six hex chars is below the commit-hash threshold.
        assert!(is_version_ref("1a2b3c"));
    }

    #[test]
    fn prefix_extraction() {
        assert_eq!(extract_version_prefix("v1.2.3"), "v");
        assert_eq!(extract_version_prefix("release-4.0"), "release-");
        assert_eq!(extract_version_prefix("1.2.3"), "");
        assert_eq!(extract_version_prefix("nodigits"), "");
    }

    #[test]
    fn prefix_candidates_collapse_trailing_v() {
        assert_eq!(build_version_prefixes("v"), vec!["v", ""]);
        assert_eq!(build_version_prefixes("releasev"), vec!["releasev", "v"]);
        assert_eq!(build_version_prefixes("release-"), vec!["release-"]);
    }

    #[test]
    fn first_matching_tag_wins() {
        let tags: Vec<serde_json::Value> = ["v1.3.0", "v1.2.3", "v1.2.4-rc1"]
            .iter()
            .map(|name| serde_json::json!({"name": name}))
            .collect();
        assert_eq!(
            select_tag_from_tags(&tags, "v"),
            Some("v1.3.0".to_string())
        );
    }

    #[test]
    fn releases_filter_drafts_and_prereleases() {
        let releases = vec![
            serde_json::json!({"tag_name": "v2.0.0-rc1", "prerelease": true}),
            serde_json::json!({"tag_name": "v2.0.0-draft", "draft": true}),
            serde_json::json!({"tag_name": "v1.9.0"}),
        ];
        assert_eq!(
            select_tag_from_releases(&releases, "v"),
            Some("v1.9.0".to_string())
        );
    }

    #[test]
    fn bare_prefix_matches_leading_digit_tags() {
        let tags = vec![
            serde_json::json!({"name": "latest"}),
            serde_json::json!({"name": "24.05"}),
        ];
        assert_eq!(select_tag_from_tags(&tags, ""), Some("24.05".to_string()));
    }

    #[test]
    fn eligible_inputs_come_from_the_lock_graph() {
        let nar = "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        let lock = FlakeLock::from_json(&format!(
            r#"{{
              "nodes": {{
                "editor": {{
                  "locked": {{"type": "github", "owner": "acme", "repo": "editor",
                             "rev": "1111111111111111111111111111111111111111",
                             "narHash": "{nar}"}},
                  "original": {{"type": "github", "owner": "acme", "repo": "editor",
                               "ref": "v1.2.3"}}
                }},
                "nixpkgs": {{
                  "locked": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                             "rev": "2222222222222222222222222222222222222222",
                             "narHash": "{nar}"}},
                  "original": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                               "ref": "nixos-unstable"}}
                }},
                "root": {{"inputs": {{"editor": "editor", "nixpkgs": "nixpkgs"}}}}
              }},
              "root": "root",
              "version": 7
            }}"#
        ))
        .unwrap();

        let inputs = get_flake_inputs_with_refs(&lock);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "editor");
        assert_eq!(inputs[0].reference, "v1.2.3");
        assert_eq!(inputs[0].input_type, "github");
    }
}
