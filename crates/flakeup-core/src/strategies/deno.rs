//! Platform-sharded dependency cache hashes.
//!
//! The build tool reads the per-package `sources.json` at eval time, so
//! computing the hash for platform P requires the file to already carry
//! the sentinel for P and usable digests for the other platforms. The
//! whole dance runs under the package's advisory file lock, and the
//! original file contents are restored no matter how the run ends.

use std::collections::BTreeMap;

use flakeup_events::EventSender;
use flakeup_types::{HashCollection, HashEntry, HashType, SourceEntry, UpdateError};

use crate::context::{RunContext, current_nix_platform};
use crate::lockfile::FileLockGuard;
use crate::sources::{load_source_entry, save_source_entry};
use crate::strategies::fixed_output::compute_overlay_hash;

/// Build the temporary hash entries staged before computing platform
/// `active_platform`: the sentinel for the active platform, and the best
/// known digest (freshly computed, then pre-existing, then sentinel) for
/// every other platform.
pub(crate) fn build_deno_hash_entries(
    platforms: &[String],
    active_platform: &str,
    existing: &BTreeMap<String, String>,
    computed: &BTreeMap<String, String>,
    fake_hash: &str,
) -> Vec<HashEntry> {
    platforms
        .iter()
        .map(|platform| {
            let digest = if platform == active_platform {
                fake_hash
            } else {
                computed
                    .get(platform)
                    .or_else(|| existing.get(platform))
                    .map(String::as_str)
                    .unwrap_or(fake_hash)
            };
            HashEntry {
                git_dep: None,
                hash: digest.to_string(),
                hash_type: HashType::DenoDepsHash,
                platform: Some(platform.clone()),
                url: None,
                urls: None,
            }
        })
        .collect()
}

/// Platform digests already present in an entry, whichever shape it uses.
pub(crate) fn existing_platform_hashes(entry: &SourceEntry) -> BTreeMap<String, String> {
    match &entry.hashes {
        HashCollection::Entries(entries) => entries
            .iter()
            .filter_map(|entry| {
                entry
                    .platform
                    .as_ref()
                    .map(|platform| (platform.clone(), entry.hash.clone()))
            })
            .collect(),
        HashCollection::Mapping(mapping) => mapping.clone(),
    }
}

fn temp_entry(original: &SourceEntry, input_name: &str, entries: Vec<HashEntry>) -> SourceEntry {
    let mut staged = original.clone();
    staged.hashes = HashCollection::Entries(entries);
    staged.input = Some(input_name.to_string());
    staged
}

/// Compute Deno dependency hashes across the configured platforms.
///
/// Errors when the current platform is not in the configured platform
/// list; call sites wanting a skip must filter beforehand. A build
/// failure for a non-current platform preserves that platform's
/// pre-existing digest and continues with a warning; a failure for the
/// current platform aborts.
pub async fn compute_deno_deps_hashes(
    source: &str,
    input_name: &str,
    native_only: bool,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<BTreeMap<String, String>, UpdateError> {
    let current_platform = current_nix_platform();
    let platforms = ctx.config.deno_platforms.clone();
    if !platforms.contains(&current_platform) {
        return Err(UpdateError::message(format!(
            "current platform {current_platform} not in supported platforms: {platforms:?}"
        )));
    }

    let Some(path) = ctx.paths.sources_file_for(source)? else {
        return Err(UpdateError::message(format!(
            "no sources.json found for '{source}'"
        )));
    };

    let _lock = FileLockGuard::acquire(&path).await?;
    let original = load_source_entry(&path)?;
    let existing = existing_platform_hashes(&original);

    let platforms_to_compute: Vec<String> = if native_only {
        vec![current_platform.clone()]
    } else {
        platforms.clone()
    };

    let mut computed: BTreeMap<String, String> = BTreeMap::new();
    let mut failed_platforms: Vec<String> = Vec::new();

    let run = async {
        for platform in &platforms_to_compute {
            events
                .status(source, format!("Computing hash for {platform}..."))
                .await;

            let staged_entries =
                build_deno_hash_entries(&platforms, platform, &existing, &computed, &ctx.config.fake_hash);
            // The build tool reads the real per-package file at eval
            // time, so the staged entries must land on disk first.
            save_source_entry(&path, &temp_entry(&original, input_name, staged_entries))?;

            let label = format!("{source}:{platform}");
            match compute_overlay_hash(&label, source, Some(platform), ctx, events).await {
                Ok(digest) => {
                    computed.insert(platform.clone(), digest);
                }
                Err(_) if platform != &current_platform => {
                    failed_platforms.push(platform.clone());
                    if let Some(existing_digest) = existing.get(platform) {
                        events
                            .status(
                                source,
                                format!("Build failed for {platform}, preserving existing hash"),
                            )
                            .await;
                        computed.insert(platform.clone(), existing_digest.clone());
                    } else {
                        events
                            .status(
                                source,
                                format!("Build failed for {platform}, no existing hash to preserve"),
                            )
                            .await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
    .await;

    // Restore the original contents whatever happened above, so an
    // aborted run can never leave sentinels on disk.
    save_source_entry(&path, &original)?;
    run?;

    if !failed_platforms.is_empty() {
        events
            .status(
                source,
                format!(
                    "Warning: {} platform(s) failed, preserved existing hashes: {}",
                    failed_platforms.len(),
                    failed_platforms.join(", ")
                ),
            )
            .await;
    }

    let mut final_hashes = existing;
    final_hashes.extend(computed);
    Ok(final_hashes)
}

#[cfg(test)]
mod tests {
    use flakeup_types::DEFAULT_FAKE_HASH;

    use super::*;

    const DIGEST_A: &str = "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=";
    const DIGEST_B: &str = "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=";

    fn platforms() -> Vec<String> {
        vec![
            "aarch64-darwin".to_string(),
            "aarch64-linux".to_string(),
            "x86_64-linux".to_string(),
        ]
    }

    #[test]
    fn active_platform_gets_the_sentinel() {
        let entries = build_deno_hash_entries(
            &platforms(),
            "aarch64-linux",
            &BTreeMap::new(),
            &BTreeMap::new(),
            DEFAULT_FAKE_HASH,
        );
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert_eq!(entry.hash, DEFAULT_FAKE_HASH);
            assert_eq!(entry.hash_type, HashType::DenoDepsHash);
        }
    }

    #[test]
    fn computed_digests_shadow_existing_ones() {
        let existing = BTreeMap::from([
            ("aarch64-darwin".to_string(), DIGEST_A.to_string()),
            ("x86_64-linux".to_string(), DIGEST_A.to_string()),
        ]);
        let computed = BTreeMap::from([("x86_64-linux".to_string(), DIGEST_B.to_string())]);

        let entries = build_deno_hash_entries(
            &platforms(),
            "aarch64-linux",
            &existing,
            &computed,
            DEFAULT_FAKE_HASH,
        );
        let by_platform: BTreeMap<&str, &str> = entries
            .iter()
            .map(|e| (e.platform.as_deref().unwrap(), e.hash.as_str()))
            .collect();
        assert_eq!(by_platform["aarch64-darwin"], DIGEST_A);
        assert_eq!(by_platform["aarch64-linux"], DEFAULT_FAKE_HASH);
        assert_eq!(by_platform["x86_64-linux"], DIGEST_B);
    }

    #[test]
    fn existing_hashes_read_from_both_shapes() {
        let from_entries = SourceEntry::new(HashCollection::Entries(vec![
            HashEntry::new(HashType::DenoDepsHash, DIGEST_A)
                .unwrap()
                .with_platform("x86_64-linux"),
            HashEntry::new(HashType::SrcHash, DIGEST_B).unwrap(),
        ]));
        let hashes = existing_platform_hashes(&from_entries);
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes["x86_64-linux"], DIGEST_A);

        let from_mapping = SourceEntry::new(HashCollection::Mapping(BTreeMap::from([(
            "aarch64-darwin".to_string(),
            DIGEST_B.to_string(),
        )])));
        assert_eq!(
            existing_platform_hashes(&from_mapping)["aarch64-darwin"],
            DIGEST_B
        );
    }

    #[test]
    fn unsupported_current_platform_is_an_error() {
        use flakeup_config::UpdateConfig;

        use crate::context::RunContext;
        use crate::paths::RepoPaths;
        use crate::registry::UpdaterRegistry;

        let dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig {
            deno_platforms: vec!["riscv64-linux".to_string()],
            ..Default::default()
        };
        let ctx =
            RunContext::new(config, RepoPaths::at(dir.path()), UpdaterRegistry::default()).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (sink, _rx) = flakeup_events::channel();
            let err = compute_deno_deps_hashes("app", "app", false, &ctx, &sink)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("not in supported platforms"));
        });
    }

    #[cfg(unix)]
    mod sharded {
        use std::os::unix::fs::PermissionsExt;

        use flakeup_config::UpdateConfig;
        use flakeup_events::channel;

        use super::super::*;
        use crate::context::{RunContext, current_nix_platform};
        use crate::paths::RepoPaths;
        use crate::registry::UpdaterRegistry;
        use crate::sources::save_source_entry;

        const DIGEST_A: &str = "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=";
        const GOT: &str = "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=";

        fn install_fake_nix(dir: &std::path::Path, script: &str) -> std::path::PathBuf {
            let path = dir.join("nix");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn seed(dir: &std::path::Path) -> std::path::PathBuf {
            let path = dir.join("packages/app/sources.json");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let entry = SourceEntry::new(HashCollection::Mapping(BTreeMap::from([(
                "aarch64-darwin".to_string(),
                DIGEST_A.to_string(),
            )])))
            .with_input("app");
            save_source_entry(&path, &entry).unwrap();
            path
        }

        fn context(dir: &std::path::Path) -> RunContext {
            let config = UpdateConfig {
                deno_platforms: vec!["aarch64-darwin".to_string(), current_nix_platform()],
                ..Default::default()
            };
            RunContext::new(config, RepoPaths::at(dir), UpdaterRegistry::default()).unwrap()
        }

        #[test]
        fn sharded_computation_merges_and_restores() {
            let dir = tempfile::tempdir().unwrap();
            let path = seed(dir.path());
            let original = std::fs::read(&path).unwrap();
            let fake = install_fake_nix(
                dir.path(),
                &format!(
                    "#!/bin/sh\n\
                     echo \"error: hash mismatch in fixed-output derivation '/nix/store/x.drv':\" >&2\n\
                     echo \"  got: {GOT}\" >&2\n\
                     exit 102\n"
                ),
            );

            temp_env::with_var("FLAKEUP_NIX_BIN", Some(fake.to_str().unwrap()), || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let ctx = context(dir.path());
                    let (sink, _rx) = channel();
                    let hashes = compute_deno_deps_hashes("app", "app", false, &ctx, &sink)
                        .await
                        .unwrap();
                    assert_eq!(hashes["aarch64-darwin"], GOT);
                    assert_eq!(hashes[&current_nix_platform()], GOT);
                });
            });

            // The on-disk file ends exactly as it began.
            assert_eq!(std::fs::read(&path).unwrap(), original);
            assert!(!path.with_file_name("sources.json.lock").exists());
        }

        #[test]
        fn current_platform_failure_rolls_back_the_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = seed(dir.path());
            let original = std::fs::read(&path).unwrap();
            // Fails with no recognizable mismatch: every build errors, the
            // non-current platform preserves its digest, the current one
            // aborts the run.
            let fake = install_fake_nix(
                dir.path(),
                "#!/bin/sh\necho 'error: builder exploded' >&2\nexit 1\n",
            );

            temp_env::with_var("FLAKEUP_NIX_BIN", Some(fake.to_str().unwrap()), || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let ctx = context(dir.path());
                    let (sink, _rx) = channel();
                    let err = compute_deno_deps_hashes("app", "app", false, &ctx, &sink)
                        .await
                        .unwrap_err();
                    assert!(matches!(err, UpdateError::HashExtraction { .. }));
                });
            });

            assert_eq!(std::fs::read(&path).unwrap(), original);
            assert!(!path.with_file_name("sources.json.lock").exists());
        }

        #[test]
        fn native_only_computes_just_the_current_platform() {
            let dir = tempfile::tempdir().unwrap();
            let path = seed(dir.path());
            let fake = install_fake_nix(
                dir.path(),
                &format!(
                    "#!/bin/sh\n\
                     echo \"error: hash mismatch in fixed-output derivation '/nix/store/x.drv':\" >&2\n\
                     echo \"  got: {GOT}\" >&2\n\
                     exit 102\n"
                ),
            );

            temp_env::with_var("FLAKEUP_NIX_BIN", Some(fake.to_str().unwrap()), || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let ctx = context(dir.path());
                    let (sink, _rx) = channel();
                    let hashes = compute_deno_deps_hashes("app", "app", true, &ctx, &sink)
                        .await
                        .unwrap();
                    // Current platform recomputed, darwin preserved from disk.
                    assert_eq!(hashes[&current_nix_platform()], GOT);
                    assert_eq!(hashes["aarch64-darwin"], DIGEST_A);
                });
            });
            assert!(path.exists());
        }
    }

    #[test]
    fn staged_entry_keeps_original_metadata() {
        let original = SourceEntry::new(HashCollection::Mapping(BTreeMap::new()))
            .with_version("1.0.0")
            .with_drv_hash("abc");
        let staged = temp_entry(&original, "upstream", vec![]);
        assert_eq!(staged.version.as_deref(), Some("1.0.0"));
        assert_eq!(staged.drv_hash.as_deref(), Some("abc"));
        assert_eq!(staged.input.as_deref(), Some("upstream"));
        assert!(staged.hashes.entries().unwrap().is_empty());
    }
}
