//! Updater for flake-input sources with transitive git dependencies
//! declared in an upstream `Cargo.lock`.

use async_trait::async_trait;

use flakeup_events::EventSender;
use flakeup_types::{HashCollection, HashEntry, SourceEntry, SourceHashes, UpdateError};

use crate::context::RunContext;
use crate::strategies::{CargoLockGitDep, compute_import_cargo_lock_output_hashes};
use crate::updater::{Updater, VersionInfo};

/// Tracks a flake input's locked revision and resolves each declared git
/// dependency's output hash from the upstream lock file.
pub struct CargoLockGitDepsUpdater {
    name: String,
    input: String,
    lockfile_path: String,
    git_deps: Vec<CargoLockGitDep>,
}

impl CargoLockGitDepsUpdater {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        lockfile_path: impl Into<String>,
        git_deps: Vec<CargoLockGitDep>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            lockfile_path: lockfile_path.into(),
            git_deps,
        }
    }
}

#[async_trait]
impl Updater for CargoLockGitDepsUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_name(&self) -> Option<&str> {
        Some(&self.input)
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        let node = ctx.input_node(&self.input)?;
        let mut info = VersionInfo::new(node.version());
        if let Some(rev) = node.locked.as_ref().and_then(|locked| locked.rev.clone()) {
            info = info.with_commit(rev);
        }
        Ok(info)
    }

    /// Up to date only when the pinned revision is unchanged. An entry
    /// without a stored commit can never prove freshness, so it
    /// recomputes.
    async fn is_latest(
        &self,
        current: Option<&SourceEntry>,
        info: &VersionInfo,
        _ctx: &RunContext,
    ) -> bool {
        let Some(current) = current else {
            return false;
        };
        match (&info.commit, &current.commit) {
            (Some(upstream), Some(ours)) => upstream == ours,
            _ => false,
        }
    }

    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        let mut entry = SourceEntry::new(hashes).with_input(&self.input);
        if let Some(commit) = &info.commit {
            entry = entry.with_commit(commit.clone());
        }
        Ok(entry)
    }

    async fn fetch_hashes(
        &self,
        _info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let hashes = compute_import_cargo_lock_output_hashes(
            &self.name,
            &self.input,
            &self.lockfile_path,
            &self.git_deps,
            ctx,
            events,
        )
        .await?;

        let mut entries = Vec::with_capacity(self.git_deps.len());
        for dep in &self.git_deps {
            let digest = hashes.get(&dep.git_dep).ok_or_else(|| {
                UpdateError::message(format!("missing hash for {}", dep.git_dep))
            })?;
            entries.push(
                HashEntry::new(dep.hash_type, digest.clone())?.with_git_dep(dep.git_dep.clone()),
            );
        }
        Ok(HashCollection::Entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use flakeup_config::UpdateConfig;
    use flakeup_types::HashType;

    use super::*;
    use crate::paths::RepoPaths;
    use crate::registry::UpdaterRegistry;

    fn updater() -> CargoLockGitDepsUpdater {
        CargoLockGitDepsUpdater::new(
            "desktop-app",
            "desktop",
            "src-tauri/Cargo.lock",
            vec![CargoLockGitDep {
                git_dep: "tauri-2.9.5".to_string(),
                hash_type: HashType::TauriOutputHash,
                match_name: "tauri".to_string(),
            }],
        )
    }

    fn test_ctx() -> (tempfile::TempDir, RunContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(
            UpdateConfig::default(),
            RepoPaths::at(dir.path()),
            UpdaterRegistry::default(),
        )
        .unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn staleness_is_decided_by_commit_only() {
        let (_dir, ctx) = test_ctx();
        let updater = updater();
        let info = VersionInfo::new("v2").with_commit("a".repeat(40));

        let same = SourceEntry::new(HashCollection::Entries(vec![]))
            .with_commit("a".repeat(40));
        assert!(updater.is_latest(Some(&same), &info, &ctx).await);

        let moved = SourceEntry::new(HashCollection::Entries(vec![]))
            .with_commit("b".repeat(40));
        assert!(!updater.is_latest(Some(&moved), &info, &ctx).await);

        let no_commit = SourceEntry::new(HashCollection::Entries(vec![]));
        assert!(!updater.is_latest(Some(&no_commit), &info, &ctx).await);
        assert!(!updater.is_latest(None, &info, &ctx).await);
    }

    #[test]
    fn result_carries_input_and_commit_but_no_version() {
        let updater = updater();
        let info = VersionInfo::new("v2").with_commit("a".repeat(40));
        let entry = updater
            .build_result(&info, HashCollection::Entries(vec![]))
            .unwrap();
        assert_eq!(entry.input.as_deref(), Some("desktop"));
        assert_eq!(entry.commit.as_deref(), Some("a".repeat(40).as_str()));
        assert!(entry.version.is_none());
    }
}
