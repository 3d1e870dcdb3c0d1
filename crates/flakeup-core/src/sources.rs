//! Per-package `sources.json` persistence and discovery validation.

use std::collections::BTreeSet;
use std::path::Path;

use flakeup_events::EventSender;
use flakeup_nix::nix_eval_json;
use flakeup_types::{SourceEntry, SourcesFile, UpdateError, atomic_write, canonical_json_bytes};

use crate::context::RunContext;
use crate::expr::compact_nix_expr;
use crate::lockfile::FileLockGuard;
use crate::paths::RepoPaths;

/// Load a single per-package `sources.json` entry.
///
/// Per-package files store a bare entry. A bare array is accepted as a
/// hashes-only entry for older files. Validation failures are fatal.
pub fn load_source_entry(path: &Path) -> Result<SourceEntry, UpdateError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        UpdateError::Validation(format!("failed to read {}: {err}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
        UpdateError::Validation(format!("invalid JSON in {}: {err}", path.display()))
    })?;
    let value = match value {
        serde_json::Value::Array(items) => serde_json::json!({ "hashes": items }),
        other => other,
    };
    let entry: SourceEntry = serde_json::from_value(value).map_err(|err| {
        UpdateError::Validation(format!("invalid source entry in {}: {err}", path.display()))
    })?;
    entry
        .validate()
        .map_err(|err| UpdateError::Validation(format!("{}: {err}", path.display())))?;
    Ok(entry)
}

/// Write one per-package entry atomically in canonical form.
pub fn save_source_entry(path: &Path, entry: &SourceEntry) -> Result<(), UpdateError> {
    let bytes = canonical_json_bytes(entry)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

/// Load and merge every per-package `sources.json` into one aggregate.
pub fn load_all_sources(paths: &RepoPaths) -> Result<SourcesFile, UpdateError> {
    let mut sources = SourcesFile::default();
    for (name, path) in paths.package_file_map("sources.json")? {
        sources.insert(name, load_source_entry(&path)?);
    }
    Ok(sources)
}

/// Write each entry back to its per-package file, under that package's
/// advisory lock. An entry with no package directory is an error.
pub async fn save_sources(paths: &RepoPaths, sources: &SourcesFile) -> Result<(), UpdateError> {
    let mut path_map = paths.package_file_map("sources.json")?;

    let mut missing = Vec::new();
    for name in sources.names() {
        if path_map.contains_key(name) {
            continue;
        }
        match paths.package_dir_for(name)? {
            Some(dir) => {
                path_map.insert(name.to_string(), dir.join("sources.json"));
            }
            None => missing.push(name.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(UpdateError::Validation(format!(
            "no per-package sources.json destination found for: {}",
            missing.join(", ")
        )));
    }

    for (name, entry) in &sources.entries {
        let Some(path) = path_map.get(name) else {
            continue;
        };
        let _guard = FileLockGuard::acquire(path).await?;
        save_source_entry(path, entry)?;
    }
    Ok(())
}

/// Source names discovered by the filesystem scan.
pub fn scanned_source_names(paths: &RepoPaths) -> Result<BTreeSet<String>, UpdateError> {
    Ok(paths
        .package_file_map("sources.json")?
        .into_keys()
        .collect())
}

/// Source names declared on the Nix side via `outputs.lib.sources`.
pub async fn nix_source_names(
    ctx: &RunContext,
    events: &EventSender,
) -> Result<BTreeSet<String>, UpdateError> {
    let flake_url = format!("git+file://{}?dirty=1", ctx.paths.root().display());
    let expr = compact_nix_expr(&format!(
        r#"let flake = builtins.getFlake "{flake_url}";
           in builtins.attrNames flake.outputs.lib.sources"#
    ));
    let payload = nix_eval_json("sources", &expr, true, &ctx.config, events).await?;
    let names = payload
        .as_array()
        .ok_or_else(|| {
            UpdateError::Validation(format!("unexpected nix source name payload: {payload}"))
        })?
        .iter()
        .map(|value| {
            value.as_str().map(str::to_string).ok_or_else(|| {
                UpdateError::Validation(format!("unexpected nix source name payload: {payload}"))
            })
        })
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
}

/// Ensure the filesystem scan and the Nix-side source set agree.
///
/// This is the hard invariant behind the validate operation: any
/// asymmetry fails with both directions listed.
pub async fn validate_source_discovery_consistency(
    ctx: &RunContext,
    events: &EventSender,
) -> Result<(), UpdateError> {
    let scanned = scanned_source_names(&ctx.paths)?;
    let nix_side = nix_source_names(ctx, events).await?;
    report_discovery_asymmetry(&scanned, &nix_side)
}

pub(crate) fn report_discovery_asymmetry(
    scanned: &BTreeSet<String>,
    nix_side: &BTreeSet<String>,
) -> Result<(), UpdateError> {
    let missing_in_nix: Vec<&str> = scanned.difference(nix_side).map(String::as_str).collect();
    let missing_in_scan: Vec<&str> = nix_side.difference(scanned).map(String::as_str).collect();
    if missing_in_nix.is_empty() && missing_in_scan.is_empty() {
        return Ok(());
    }
    let mut lines = vec!["source discovery mismatch detected:".to_string()];
    if !missing_in_nix.is_empty() {
        lines.push(format!(
            "- missing in nix outputs.lib.sources: {}",
            missing_in_nix.join(", ")
        ));
    }
    if !missing_in_scan.is_empty() {
        lines.push(format!(
            "- missing in filesystem scan: {}",
            missing_in_scan.join(", ")
        ));
    }
    Err(UpdateError::Validation(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use flakeup_types::{HashCollection, HashEntry, HashType};

    use super::*;

    const DIGEST: &str = "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=";

    fn sample_entry() -> SourceEntry {
        SourceEntry::new(HashCollection::Entries(vec![
            HashEntry::new(HashType::VendorHash, DIGEST).unwrap(),
        ]))
        .with_version("1.0.0")
    }

    #[test]
    fn entry_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        save_source_entry(&path, &sample_entry()).unwrap();

        let loaded = load_source_entry(&path).unwrap();
        assert_eq!(loaded, sample_entry());

        // Saving the loaded entry is byte-stable.
        let before = std::fs::read(&path).unwrap();
        save_source_entry(&path, &loaded).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn bare_hash_arrays_load_as_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        std::fs::write(
            &path,
            format!(r#"[{{"hash": "{DIGEST}", "hashType": "srcHash"}}]"#),
        )
        .unwrap();

        let entry = load_source_entry(&path).unwrap();
        assert_eq!(entry.hashes.entries().unwrap().len(), 1);
        assert!(entry.version.is_none());
    }

    #[test]
    fn invalid_digest_fails_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        std::fs::write(
            &path,
            r#"{"hashes": {"x86_64-linux": "not-a-digest"}}"#,
        )
        .unwrap();

        let err = load_source_entry(&path).unwrap_err();
        assert!(matches!(err, UpdateError::Validation(_)));
    }

    #[test]
    fn load_all_sources_aggregates_by_package_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::at(dir.path());
        for name in ["alpha", "beta"] {
            let path = dir.path().join("packages").join(name).join("sources.json");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            save_source_entry(&path, &sample_entry()).unwrap();
        }

        let sources = load_all_sources(&paths).unwrap();
        assert_eq!(sources.names().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn save_sources_writes_per_package_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::at(dir.path());
        std::fs::create_dir_all(dir.path().join("packages/alpha")).unwrap();

        let mut sources = SourcesFile::default();
        sources.insert("alpha", sample_entry());
        save_sources(&paths, &sources).await.unwrap();

        assert!(dir.path().join("packages/alpha/sources.json").exists());
        // Lock files are cleaned up afterwards.
        assert!(!dir.path().join("packages/alpha/sources.json.lock").exists());
    }

    #[tokio::test]
    async fn save_sources_rejects_unknown_packages() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::at(dir.path());
        let mut sources = SourcesFile::default();
        sources.insert("ghost", sample_entry());

        let err = save_sources(&paths, &sources).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn discovery_asymmetry_reports_both_directions() {
        let scanned: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let nix_side: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();

        let err = report_discovery_asymmetry(&scanned, &nix_side).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("missing in nix outputs.lib.sources: a"));
        assert!(text.contains("missing in filesystem scan: c"));

        assert!(report_discovery_asymmetry(&scanned, &scanned).is_ok());
    }
}
