//! The updater framework: a two-phase protocol every source kind
//! implements, plus the shared compare-and-skip / result-build flow.

use std::collections::BTreeMap;

use async_trait::async_trait;

use flakeup_events::{EventPayload, EventSender};
use flakeup_types::{SourceEntry, SourceHashes, UpdateError};

use crate::context::RunContext;

pub mod cargo_lock;
pub mod flake_input;
pub mod forge_kinds;

pub use cargo_lock::CargoLockGitDepsUpdater;
pub use flake_input::{FlakeHashKind, FlakeInputHashUpdater};
pub use forge_kinds::{
    ChecksumProvidedUpdater, DownloadHashUpdater, FixedOutputPairUpdater, GithubRawFileUpdater,
    PlatformApiUpdater, VersionProbe, verify_platform_versions,
};

/// Latest upstream version metadata fetched by an updater.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub version: String,
    /// Upstream commit, when the source of truth pins one.
    pub commit: Option<String>,
    /// Free-form details stashed by `fetch_latest` for `fetch_hashes`.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl VersionInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            commit: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One update source.
///
/// Implementations provide the two abstract phases (`fetch_latest`,
/// `fetch_hashes`); the shared `update_stream` drives the full
/// check/hash/build/finalize flow and reports through events.
#[async_trait]
pub trait Updater: Send + Sync {
    fn name(&self) -> &str;

    /// The flake input this source is bound to, when any.
    fn input_name(&self) -> Option<&str> {
        None
    }

    /// External binaries this updater needs on `$PATH`.
    fn required_tools(&self) -> &'static [&'static str] {
        &["nix"]
    }

    /// Fetch latest upstream version details.
    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError>;

    /// Compute source hashes for the fetched version, reporting progress
    /// through `events`.
    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError>;

    /// Construct the new source entry from version and hashes.
    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        Ok(SourceEntry::new(hashes).with_version(&info.version))
    }

    /// Whether the on-disk entry already matches upstream. The default
    /// compares version strings and, when both sides carry one, commits —
    /// so a source that moves its commit under an unchanged version tag
    /// is treated as stale.
    async fn is_latest(
        &self,
        current: Option<&SourceEntry>,
        info: &VersionInfo,
        _ctx: &RunContext,
    ) -> bool {
        let Some(current) = current else {
            return false;
        };
        if current.version.as_deref() != Some(info.version.as_str()) {
            return false;
        }
        if let (Some(upstream), Some(ours)) = (&info.commit, &current.commit) {
            return upstream == ours;
        }
        true
    }

    /// Hook to attach extra metadata to the result before the equality
    /// check. The default returns it unchanged.
    async fn finalize_result(
        &self,
        result: SourceEntry,
        _ctx: &RunContext,
        _events: &EventSender,
    ) -> Result<SourceEntry, UpdateError> {
        Ok(result)
    }

    /// Run the fetch/check/hash/build flow and emit update events,
    /// ending in exactly one RESULT: with the new entry as payload when
    /// something changed, with no payload otherwise.
    async fn update_stream(
        &self,
        current: Option<&SourceEntry>,
        ctx: &RunContext,
        events: &EventSender,
        pinned_version: Option<VersionInfo>,
    ) -> Result<(), UpdateError> {
        let name = self.name();

        let info = match pinned_version {
            Some(pinned) => {
                events
                    .status(name, format!("Using pinned version: {}", pinned.version))
                    .await;
                pinned
            }
            None => {
                events
                    .status(name, format!("Fetching latest {name} version..."))
                    .await;
                self.fetch_latest(ctx).await?
            }
        };

        events
            .status(name, format!("Latest version: {}", info.version))
            .await;
        if self.is_latest(current, &info, ctx).await {
            events
                .status(name, format!("Up to date (version: {})", info.version))
                .await;
            events.result(name, None).await;
            return Ok(());
        }

        events
            .status(name, "Fetching hashes for all platforms...")
            .await;
        let hashes = self.fetch_hashes(&info, ctx, events).await?;
        let result = self.build_result(&info, hashes)?;
        let result = self.finalize_result(result, ctx, events).await?;

        if current == Some(&result) {
            events.status(name, "Up to date").await;
            events.result(name, None).await;
            return Ok(());
        }
        events
            .result(name, Some(EventPayload::Entry(result)))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flakeup_config::UpdateConfig;
    use flakeup_events::{EventKind, UpdateEvent, channel};
    use flakeup_types::{HashCollection, HashEntry, HashType};

    use super::*;
    use crate::paths::RepoPaths;
    use crate::registry::UpdaterRegistry;

    const DIGEST: &str = "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=";

    struct StubUpdater {
        latest: String,
        commit: Option<String>,
    }

    #[async_trait]
    impl Updater for StubUpdater {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_latest(&self, _ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
            let mut info = VersionInfo::new(&self.latest);
            if let Some(commit) = &self.commit {
                info = info.with_commit(commit.clone());
            }
            Ok(info)
        }

        async fn fetch_hashes(
            &self,
            _info: &VersionInfo,
            _ctx: &RunContext,
            events: &EventSender,
        ) -> Result<SourceHashes, UpdateError> {
            events.status("stub", "hashing").await;
            Ok(HashCollection::Entries(vec![
                HashEntry::new(HashType::Sha256, DIGEST).unwrap(),
            ]))
        }
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

    fn current_entry(version: &str) -> SourceEntry {
        SourceEntry::new(HashCollection::Entries(vec![
            HashEntry::new(HashType::Sha256, DIGEST).unwrap(),
        ]))
        .with_version(version)
    }

    async fn collect(
        updater: &dyn Updater,
        current: Option<&SourceEntry>,
        ctx: &RunContext,
        pinned: Option<VersionInfo>,
    ) -> Vec<UpdateEvent> {
        let (sink, mut rx) = channel();
        updater
            .update_stream(current, ctx, &sink, pinned)
            .await
            .unwrap();
        drop(sink);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn up_to_date_source_emits_result_without_payload() {
        let (_dir, ctx) = test_ctx();
        let updater = StubUpdater {
            latest: "1.0.0".to_string(),
            commit: None,
        };
        let current = current_entry("1.0.0");

        let events = collect(&updater, Some(&current), &ctx, None).await;
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        assert!(result.payload.is_none());
        assert!(events
            .iter()
            .any(|e| e.message.as_deref() == Some("Up to date (version: 1.0.0)")));
    }

    #[tokio::test]
    async fn version_bump_emits_new_entry() {
        let (_dir, ctx) = test_ctx();
        let updater = StubUpdater {
            latest: "1.1.0".to_string(),
            commit: None,
        };
        let current = current_entry("1.0.0");

        let events = collect(&updater, Some(&current), &ctx, None).await;
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        let Some(EventPayload::Entry(entry)) = &result.payload else {
            panic!("expected an entry payload");
        };
        assert_eq!(entry.version.as_deref(), Some("1.1.0"));
        assert_eq!(entry.hashes.primary_hash(), Some(DIGEST));
    }

    #[tokio::test]
    async fn missing_current_entry_always_updates() {
        let (_dir, ctx) = test_ctx();
        let updater = StubUpdater {
            latest: "1.0.0".to_string(),
            commit: None,
        };
        let events = collect(&updater, None, &ctx, None).await;
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        assert!(result.payload.is_some());
    }

    #[tokio::test]
    async fn moved_commit_under_same_version_is_stale() {
        let (_dir, ctx) = test_ctx();
        let updater = StubUpdater {
            latest: "1.0.0".to_string(),
            commit: Some("b".repeat(40)),
        };
        let current = current_entry("1.0.0").with_commit("a".repeat(40));

        let events = collect(&updater, Some(&current), &ctx, None).await;
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        assert!(result.payload.is_some(), "commit change must recompute");
    }

    #[tokio::test]
    async fn pinned_version_bypasses_fetch_latest() {
        let (_dir, ctx) = test_ctx();
        let updater = StubUpdater {
            latest: "9.9.9".to_string(),
            commit: None,
        };
        let events = collect(
            &updater,
            None,
            &ctx,
            Some(VersionInfo::new("2.0.0")),
        )
        .await;

        assert!(events
            .iter()
            .any(|e| e.message.as_deref() == Some("Using pinned version: 2.0.0")));
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        let Some(EventPayload::Entry(entry)) = &result.payload else {
            panic!("expected an entry payload");
        };
        assert_eq!(entry.version.as_deref(), Some("2.0.0"));
    }

    struct AlwaysStaleUpdater(StubUpdater);

    #[async_trait]
    impl Updater for AlwaysStaleUpdater {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
            self.0.fetch_latest(ctx).await
        }

        async fn fetch_hashes(
            &self,
            info: &VersionInfo,
            ctx: &RunContext,
            events: &EventSender,
        ) -> Result<SourceHashes, UpdateError> {
            self.0.fetch_hashes(info, ctx, events).await
        }

        async fn is_latest(
            &self,
            _current: Option<&SourceEntry>,
            _info: &VersionInfo,
            _ctx: &RunContext,
        ) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn identical_rebuilt_entry_reports_no_change() {
        let (_dir, ctx) = test_ctx();
        // Staleness check says recompute, but the rebuilt entry comes out
        // byte-identical to the current one: the run must report no change.
        let updater = AlwaysStaleUpdater(StubUpdater {
            latest: "2.0.0".to_string(),
            commit: None,
        });
        let current = current_entry("2.0.0");
        let events = collect(&updater, Some(&current), &ctx, None).await;
        let result = events.iter().find(|e| e.kind == EventKind::Result).unwrap();
        assert!(result.payload.is_none());
        assert!(events
            .iter()
            .any(|e| e.message.as_deref() == Some("Up to date")));
    }
}
