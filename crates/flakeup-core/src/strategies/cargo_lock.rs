//! Transitive git-dependency hashes via upstream `Cargo.lock` parsing.
//!
//! Rust workspaces with git-sourced crates need those crates' output
//! hashes declared explicitly. Rather than evaluating nixpkgs, the
//! upstream lock file is fetched from the forge at the pinned revision
//! and walked directly; each resolved `(url, rev)` is prefetched with
//! `builtins.fetchGit` to read its `narHash`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use flakeup_events::{EventPayload, EventSender, EventStream, gather_event_streams};
use flakeup_forge::github_raw_url;
use flakeup_nix::nix_eval_json;
use flakeup_types::{HashType, UpdateError, is_sri};

use crate::context::RunContext;
use crate::expr::fetch_git_nar_hash_expr;

/// Cargo git dependency descriptor used for output hash collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoLockGitDep {
    /// Key in the resulting map and on the hash entry (`name-version`).
    pub git_dep: String,
    /// Role the hash plays in the derivation.
    pub hash_type: HashType,
    /// Crate-name prefix used when the exact `name-version` key is
    /// absent from the lock file.
    pub match_name: String,
}

static GIT_SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^source = "git\+(?P<url>[^?#]+)\?[^#]*#(?P<commit>[0-9a-f]+)"$"#).unwrap()
});

/// Walk a `Cargo.lock` and return `{git_dep: (url, rev)}` for each
/// declared dependency.
///
/// Packages are matched first by exact `name-version`, then by a crate
/// name prefix when that prefix is unique among the remaining unmatched
/// dependencies. Any dependency left unmatched is a hard error.
pub fn parse_cargo_lock_git_sources(
    lockfile: &str,
    git_deps: &[CargoLockGitDep],
) -> Result<BTreeMap<String, (String, String)>, UpdateError> {
    let mut result = BTreeMap::new();
    let mut unmatched: Vec<&CargoLockGitDep> = git_deps.iter().collect();

    let mut current_name: Option<String> = None;
    let mut current_version: Option<String> = None;

    for raw_line in lockfile.lines() {
        let line = raw_line.trim();
        if let Some(rest) = line.strip_prefix("name = ") {
            current_name = quoted(rest);
            current_version = None;
        } else if let Some(rest) = line.strip_prefix("version = ") {
            current_version = quoted(rest);
        } else if line.starts_with("source = ")
            && let Some(name) = current_name.clone()
            && let Some(caps) = GIT_SOURCE_RE.captures(line)
        {
            let url = caps["url"].to_string();
            let commit = caps["commit"].to_string();
            let dep_key = match &current_version {
                Some(version) => format!("{name}-{version}"),
                None => name.clone(),
            };

            let position = unmatched
                .iter()
                .position(|dep| dep.git_dep == dep_key)
                .or_else(|| {
                    let prefix_matches: Vec<usize> = unmatched
                        .iter()
                        .enumerate()
                        .filter(|(_, dep)| name.starts_with(&dep.match_name))
                        .map(|(i, _)| i)
                        .collect();
                    match prefix_matches.as_slice() {
                        [only] => Some(*only),
                        _ => None,
                    }
                });
            if let Some(position) = position {
                let dep = unmatched.remove(position);
                result.insert(dep.git_dep.clone(), (url, commit));
            }
        }
    }

    if !unmatched.is_empty() {
        let names: Vec<&str> = unmatched.iter().map(|dep| dep.git_dep.as_str()).collect();
        return Err(UpdateError::message(format!(
            "could not find git sources in Cargo.lock for: {}",
            names.join(", ")
        )));
    }
    Ok(result)
}

fn quoted(rest: &str) -> Option<String> {
    rest.split('"').nth(1).map(str::to_string)
}

/// Compute output hashes for each declared git dependency of a flake
/// input's upstream `Cargo.lock`, keyed by dependency name.
pub async fn compute_import_cargo_lock_output_hashes(
    source: &str,
    input_name: &str,
    lockfile_path: &str,
    git_deps: &[CargoLockGitDep],
    ctx: &RunContext,
    events: &EventSender,
) -> Result<BTreeMap<String, String>, UpdateError> {
    events
        .status(source, "Fetching upstream Cargo.lock...")
        .await;

    let node = ctx.input_node(input_name)?;
    let locked = node.locked.as_ref().ok_or_else(|| {
        UpdateError::FlakeLock(format!("flake input '{input_name}' has no locked info"))
    })?;
    let (Some(owner), Some(repo), Some(rev)) = (&locked.owner, &locked.repo, &locked.rev) else {
        return Err(UpdateError::FlakeLock(format!(
            "flake input '{input_name}' missing owner/repo/rev in locked info"
        )));
    };

    let lockfile_url = github_raw_url(owner, repo, rev, lockfile_path);
    let lockfile = ctx.forge.fetch_text(&lockfile_url).await?;
    let git_sources = parse_cargo_lock_git_sources(&lockfile, git_deps)?;

    let mut streams = Vec::new();
    for dep in git_deps {
        let (url, commit) = git_sources[&dep.git_dep].clone();
        let source = source.to_string();
        let config_ctx = ctx.config.clone();
        streams.push((
            dep.git_dep.clone(),
            EventStream::spawn(move |tx| async move {
                let expr = fetch_git_nar_hash_expr(&url, &commit);
                let payload = nix_eval_json(&source, &expr, false, &config_ctx, &tx).await?;
                let sri = match payload.as_str() {
                    Some(sri) if is_sri(sri) => sri.to_string(),
                    other => {
                        return Err(UpdateError::message(format!(
                            "unexpected hash format from builtins.fetchGit: {other:?}"
                        )));
                    }
                };
                tx.value(&source, EventPayload::Text(sri)).await;
                Ok(())
            }),
        ));
    }

    let gathered = gather_event_streams(streams, events).await?;
    let mut hashes = BTreeMap::new();
    for (dep, payload) in gathered {
        hashes.insert(dep, payload.into_text()?);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(git_dep: &str, match_name: &str) -> CargoLockGitDep {
        CargoLockGitDep {
            git_dep: git_dep.to_string(),
            hash_type: HashType::TauriOutputHash,
            match_name: match_name.to_string(),
        }
    }

    const LOCKFILE: &str = r#"
[[package]]
name = "serde"
version = "1.0.228"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "specta"
version = "2.0.0-rc.22"
source = "git+https://github.com/specta-rs/specta?branch=main#deadbeef"

[[package]]
name = "tauri"
version = "2.9.5"
source = "git+https://github.com/tauri-apps/tauri?rev=X#feedface"
"#;

    #[test]
    fn resolves_declared_deps_by_name_version() {
        let deps = [
            dep("specta-2.0.0-rc.22", "specta"),
            dep("tauri-2.9.5", "tauri"),
        ];
        let sources = parse_cargo_lock_git_sources(LOCKFILE, &deps).unwrap();
        assert_eq!(
            sources["specta-2.0.0-rc.22"],
            (
                "https://github.com/specta-rs/specta".to_string(),
                "deadbeef".to_string()
            )
        );
        assert_eq!(
            sources["tauri-2.9.5"],
            (
                "https://github.com/tauri-apps/tauri".to_string(),
                "feedface".to_string()
            )
        );
    }

    #[test]
    fn falls_back_to_unique_prefix_match() {
        // Declared version drifted from the lock file; the crate-name
        // prefix still identifies the dependency.
        let deps = [dep("tauri-2.0.0", "tauri")];
        let sources = parse_cargo_lock_git_sources(LOCKFILE, &deps).unwrap();
        assert_eq!(sources["tauri-2.0.0"].1, "feedface");
    }

    #[test]
    fn ambiguous_prefix_is_not_matched() {
        let lockfile = r#"
[[package]]
name = "tauri"
version = "2.9.5"
source = "git+https://github.com/tauri-apps/tauri?rev=X#feedface"
"#;
        // Two unmatched deps share the prefix, so neither may claim the
        // package and parsing must fail.
        let deps = [dep("tauri-a", "tauri"), dep("tauri-b", "tauri")];
        let err = parse_cargo_lock_git_sources(lockfile, &deps).unwrap_err();
        assert!(err.to_string().contains("could not find git sources"));
    }

    #[test]
    fn registry_sources_are_ignored() {
        let deps = [dep("serde-1.0.228", "serde")];
        let err = parse_cargo_lock_git_sources(LOCKFILE, &deps).unwrap_err();
        assert!(err.to_string().contains("serde-1.0.228"));
    }

    #[test]
    fn unmatched_deps_fail_hard() {
        let deps = [
            dep("specta-2.0.0-rc.22", "specta"),
            dep("missing-1.0.0", "missing"),
        ];
        let err = parse_cargo_lock_git_sources(LOCKFILE, &deps).unwrap_err();
        assert!(err.to_string().contains("missing-1.0.0"));
        assert!(!err.to_string().contains("specta-2.0.0-rc.22"));
    }

    #[test]
    fn empty_dep_list_parses_to_empty_map() {
        assert!(parse_cargo_lock_git_sources(LOCKFILE, &[]).unwrap().is_empty());
    }
}
