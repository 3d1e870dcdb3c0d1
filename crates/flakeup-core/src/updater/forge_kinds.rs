//! Updater kinds whose source of truth is a forge or vendor endpoint.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use flakeup_events::{EventPayload, EventSender, EventStream, gather_event_streams};
use flakeup_forge::github_raw_url;
use flakeup_nix::hash_convert;
use flakeup_types::{HashCollection, HashEntry, HashType, SourceEntry, SourceHashes, UpdateError};

use crate::context::RunContext;
use crate::expr::{compact_nix_expr, nixpkgs_expr, with_pkgs};
use crate::strategies::{compute_fixed_output_hash, compute_url_hashes};
use crate::updater::{Updater, VersionInfo};

/// How an updater discovers the latest upstream version.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "probe",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum VersionProbe {
    /// Latest non-draft GitHub release tag.
    GithubRelease { owner: String, repo: String },
    /// A JSON endpoint; pointers are JSON Pointers into the payload.
    Json {
        url: String,
        version_pointer: String,
        #[serde(default)]
        commit_pointer: Option<String>,
    },
    /// A fetched document matched with a regex whose first capture group
    /// is the version (install-script style).
    ScriptRegex { url: String, pattern: String },
}

impl VersionProbe {
    pub async fn fetch(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        match self {
            VersionProbe::GithubRelease { owner, repo } => {
                let tag = ctx.forge.latest_release_tag(owner, repo).await?;
                Ok(VersionInfo::new(tag))
            }
            VersionProbe::Json {
                url,
                version_pointer,
                commit_pointer,
            } => {
                let payload = ctx.forge.fetch_json(url).await?;
                let version = json_string_at(&payload, version_pointer).ok_or_else(|| {
                    UpdateError::message(format!("missing version at {version_pointer} in {url}"))
                })?;
                let mut info = VersionInfo::new(version)
                    .with_metadata("payload", payload.clone());
                if let Some(pointer) = commit_pointer
                    && let Some(commit) = json_string_at(&payload, pointer)
                {
                    info = info.with_commit(commit);
                }
                Ok(info)
            }
            VersionProbe::ScriptRegex { url, pattern } => {
                let document = ctx.forge.fetch_text(url).await?;
                let re = regex::Regex::new(pattern).map_err(|err| {
                    UpdateError::Validation(format!("invalid version pattern {pattern:?}: {err}"))
                })?;
                let version = re
                    .captures(&document)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
                    .ok_or_else(|| {
                        UpdateError::message(format!(
                            "could not parse a version from {url} with {pattern:?}"
                        ))
                    })?;
                Ok(VersionInfo::new(version))
            }
        }
    }
}

fn json_string_at(payload: &serde_json::Value, pointer: &str) -> Option<String> {
    payload
        .pointer(pointer)
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

fn substitute(template: &str, version: &str, platform: &str) -> String {
    template
        .replace("{version}", version)
        .replace("{platform}", platform)
}

/// Require one version string across all platforms.
pub fn verify_platform_versions(
    versions: &BTreeMap<String, String>,
    source_name: &str,
) -> Result<String, UpdateError> {
    let mut unique: Vec<&String> = versions.values().collect();
    unique.sort();
    unique.dedup();
    match unique.as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(UpdateError::message(format!(
            "{source_name} version mismatch across platforms: {versions:?}"
        ))),
    }
}

/// Convert per-platform hex checksums to SRI concurrently.
async fn checksums_to_sri(
    source: &str,
    checksums: BTreeMap<String, String>,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<BTreeMap<String, String>, UpdateError> {
    let mut streams = Vec::new();
    for (platform, checksum) in checksums {
        let source = source.to_string();
        let config = ctx.config.clone();
        streams.push((
            platform,
            EventStream::spawn(move |tx| async move {
                let sri = hash_convert(&source, &checksum, &config, &tx).await?;
                tx.value(&source, EventPayload::Text(sri)).await;
                Ok(())
            }),
        ));
    }
    let gathered = gather_event_streams(streams, events).await?;
    let mut hashes = BTreeMap::new();
    for (platform, payload) in gathered {
        hashes.insert(platform, payload.into_text()?);
    }
    Ok(hashes)
}

/// Forge returns download URLs; hashes come from prefetching them.
pub struct DownloadHashUpdater {
    name: String,
    probe: VersionProbe,
    /// Nix platform → download URL template (`{version}` substituted).
    platforms: BTreeMap<String, String>,
}

impl DownloadHashUpdater {
    pub fn new(
        name: impl Into<String>,
        probe: VersionProbe,
        platforms: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            probe,
            platforms,
        }
    }

    fn platform_urls(&self, info: &VersionInfo) -> BTreeMap<String, String> {
        self.platforms
            .iter()
            .map(|(platform, template)| {
                (
                    platform.clone(),
                    substitute(template, &info.version, platform),
                )
            })
            .collect()
    }
}

#[async_trait]
impl Updater for DownloadHashUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["nix", "nix-prefetch-url"]
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        self.probe.fetch(ctx).await
    }

    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let urls = self.platform_urls(info);
        let url_list: Vec<String> = urls.values().cloned().collect();
        let by_url = compute_url_hashes(&self.name, &url_list, ctx, events).await?;

        let mut hashes = BTreeMap::new();
        for (platform, url) in &urls {
            let digest = by_url.get(url).ok_or_else(|| {
                UpdateError::message(format!("missing hash output for {url}"))
            })?;
            hashes.insert(platform.clone(), digest.clone());
        }
        Ok(HashCollection::Mapping(hashes))
    }

    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        let mut entry = SourceEntry::new(hashes)
            .with_version(&info.version)
            .with_urls(self.platform_urls(info));
        if let Some(commit) = &info.commit {
            entry = entry.with_commit(commit.clone());
        }
        Ok(entry)
    }
}

/// Upstream publishes checksums next to its artifacts.
pub struct ChecksumProvidedUpdater {
    name: String,
    probe: VersionProbe,
    /// Nix platform → download URL template.
    platforms: BTreeMap<String, String>,
    /// Sidecar checksum URL template; `{url}` expands to the download
    /// URL, `{version}`/`{platform}` as usual.
    checksum_url_template: String,
}

impl ChecksumProvidedUpdater {
    pub fn new(
        name: impl Into<String>,
        probe: VersionProbe,
        platforms: BTreeMap<String, String>,
        checksum_url_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            probe,
            platforms,
            checksum_url_template: checksum_url_template.into(),
        }
    }

    fn platform_urls(&self, info: &VersionInfo) -> BTreeMap<String, String> {
        self.platforms
            .iter()
            .map(|(platform, template)| {
                (
                    platform.clone(),
                    substitute(template, &info.version, platform),
                )
            })
            .collect()
    }

    fn checksum_url(&self, info: &VersionInfo, platform: &str, download_url: &str) -> String {
        substitute(&self.checksum_url_template, &info.version, platform)
            .replace("{url}", download_url)
    }
}

#[async_trait]
impl Updater for ChecksumProvidedUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        self.probe.fetch(ctx).await
    }

    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let mut checksums = BTreeMap::new();
        for (platform, url) in self.platform_urls(info) {
            let checksum_url = self.checksum_url(info, &platform, &url);
            let payload = ctx.forge.fetch_text(&checksum_url).await?;
            let checksum = payload
                .split_whitespace()
                .next()
                .map(str::to_string)
                .filter(|token| !token.is_empty())
                .ok_or_else(|| {
                    UpdateError::message(format!("empty checksum payload from {checksum_url}"))
                })?;
            checksums.insert(platform, checksum);
        }
        let hashes = checksums_to_sri(&self.name, checksums, ctx, events).await?;
        Ok(HashCollection::Mapping(hashes))
    }

    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        Ok(SourceEntry::new(hashes)
            .with_version(&info.version)
            .with_urls(self.platform_urls(info)))
    }
}

/// One JSON endpoint per platform, reconciled by version equality.
pub struct PlatformApiUpdater {
    name: String,
    /// Endpoint template with `{platform}` (the API-side token).
    endpoint_template: String,
    /// Nix platform → API platform token.
    platforms: BTreeMap<String, String>,
    version_pointer: String,
    commit_pointer: Option<String>,
    /// Pointer to a forge-supplied hex checksum; when absent, hashes come
    /// from prefetching the download URLs.
    checksum_pointer: Option<String>,
    /// Pointer to the download URL inside each platform payload.
    url_pointer: String,
}

impl PlatformApiUpdater {
    pub fn new(
        name: impl Into<String>,
        endpoint_template: impl Into<String>,
        platforms: BTreeMap<String, String>,
        version_pointer: impl Into<String>,
        commit_pointer: Option<String>,
        checksum_pointer: Option<String>,
        url_pointer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint_template: endpoint_template.into(),
            platforms,
            version_pointer: version_pointer.into(),
            commit_pointer,
            checksum_pointer,
            url_pointer: url_pointer.into(),
        }
    }

    fn platform_payloads(
        info: &VersionInfo,
    ) -> Result<BTreeMap<String, serde_json::Value>, UpdateError> {
        info.metadata
            .get("platform_info")
            .and_then(|value| value.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>()
            })
            .ok_or_else(|| UpdateError::message("missing platform payloads on version info"))
    }

    fn url_for(&self, payload: &serde_json::Value, platform: &str) -> Result<String, UpdateError> {
        json_string_at(payload, &self.url_pointer).ok_or_else(|| {
            UpdateError::message(format!(
                "missing download URL at {} for {platform}",
                self.url_pointer
            ))
        })
    }
}

#[async_trait]
impl Updater for PlatformApiUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["nix", "nix-prefetch-url"]
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        let mut payloads = serde_json::Map::new();
        let mut versions = BTreeMap::new();
        let mut commits = BTreeMap::new();
        for (nix_platform, api_platform) in &self.platforms {
            let url = self.endpoint_template.replace("{platform}", api_platform);
            let payload = ctx.forge.fetch_json(&url).await?;
            let version = json_string_at(&payload, &self.version_pointer).ok_or_else(|| {
                UpdateError::message(format!(
                    "missing version at {} in {url}",
                    self.version_pointer
                ))
            })?;
            versions.insert(nix_platform.clone(), version);
            if let Some(pointer) = &self.commit_pointer
                && let Some(commit) = json_string_at(&payload, pointer)
            {
                commits.insert(nix_platform.clone(), commit);
            }
            payloads.insert(nix_platform.clone(), payload);
        }

        let version = verify_platform_versions(&versions, &self.name)?;
        let mut info = VersionInfo::new(version)
            .with_metadata("platform_info", serde_json::Value::Object(payloads));
        if !commits.is_empty() {
            let commit = verify_platform_versions(&commits, &format!("{} commit", self.name))?;
            info = info.with_commit(commit);
        }
        Ok(info)
    }

    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let payloads = Self::platform_payloads(info)?;

        if let Some(checksum_pointer) = &self.checksum_pointer {
            let mut checksums = BTreeMap::new();
            for (platform, payload) in &payloads {
                let checksum = json_string_at(payload, checksum_pointer).ok_or_else(|| {
                    UpdateError::message(format!(
                        "missing checksum at {checksum_pointer} for {platform}"
                    ))
                })?;
                checksums.insert(platform.clone(), checksum);
            }
            let hashes = checksums_to_sri(&self.name, checksums, ctx, events).await?;
            return Ok(HashCollection::Mapping(hashes));
        }

        let mut urls = BTreeMap::new();
        for (platform, payload) in &payloads {
            urls.insert(platform.clone(), self.url_for(payload, platform)?);
        }
        let url_list: Vec<String> = urls.values().cloned().collect();
        let by_url = compute_url_hashes(&self.name, &url_list, ctx, events).await?;
        let mut hashes = BTreeMap::new();
        for (platform, url) in &urls {
            let digest = by_url
                .get(url)
                .ok_or_else(|| UpdateError::message(format!("missing hash output for {url}")))?;
            hashes.insert(platform.clone(), digest.clone());
        }
        Ok(HashCollection::Mapping(hashes))
    }

    fn build_result(
        &self,
        info: &VersionInfo,
        hashes: SourceHashes,
    ) -> Result<SourceEntry, UpdateError> {
        let payloads = Self::platform_payloads(info)?;
        let mut urls = BTreeMap::new();
        for (platform, payload) in &payloads {
            urls.insert(platform.clone(), self.url_for(payload, platform)?);
        }
        let mut entry = SourceEntry::new(hashes)
            .with_version(&info.version)
            .with_urls(urls);
        if let Some(commit) = &info.commit {
            entry = entry.with_commit(commit.clone());
        }
        Ok(entry)
    }
}

/// A fixed file in a fixed repository, tracked by the latest commit that
/// touched it.
pub struct GithubRawFileUpdater {
    name: String,
    owner: String,
    repo: String,
    path: String,
}

impl GithubRawFileUpdater {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            repo: repo.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Updater for GithubRawFileUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["nix", "nix-prefetch-url"]
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        let branch = ctx.forge.default_branch(&self.owner, &self.repo).await?;
        let rev = ctx
            .forge
            .latest_commit_for_path(&self.owner, &self.repo, &self.path, &branch)
            .await?;
        Ok(VersionInfo::new(rev))
    }

    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let url = github_raw_url(&self.owner, &self.repo, &info.version, &self.path);
        let by_url = compute_url_hashes(&self.name, std::slice::from_ref(&url), ctx, events).await?;
        let digest = by_url
            .get(&url)
            .ok_or_else(|| UpdateError::message(format!("missing hash output for {url}")))?;
        Ok(HashCollection::Entries(vec![
            HashEntry::new(HashType::Sha256, digest.clone())?.with_url(url),
        ]))
    }
}

/// Two sequential fixed-output builds: first the source hash, then a
/// vendor hash computed with that source hash substituted in.
pub struct FixedOutputPairUpdater {
    name: String,
    owner: String,
    repo: String,
    /// Shell fragment run after fetching, e.g. stripping unreproducible
    /// archive members.
    post_fetch: Option<String>,
}

impl FixedOutputPairUpdater {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        post_fetch: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            repo: repo.into(),
            post_fetch,
        }
    }

    fn src_expr(&self, version: &str, hash: &str) -> String {
        let post_fetch = match &self.post_fetch {
            Some(filter) => format!(" postFetch = \"{filter}\";"),
            None => String::new(),
        };
        compact_nix_expr(&format!(
            r#"pkgs.fetchFromGitHub {{ owner = "{}"; repo = "{}"; tag = "{version}"; hash = {hash};{post_fetch} }}"#,
            self.owner, self.repo
        ))
    }
}

#[async_trait]
impl Updater for FixedOutputPairUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_latest(&self, ctx: &RunContext) -> Result<VersionInfo, UpdateError> {
        let tag = ctx.forge.latest_release_tag(&self.owner, &self.repo).await?;
        Ok(VersionInfo::new(tag))
    }

    async fn fetch_hashes(
        &self,
        info: &VersionInfo,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Result<SourceHashes, UpdateError> {
        let nixpkgs = nixpkgs_expr(&ctx.flake_lock()?)?;

        let src_probe = with_pkgs(&nixpkgs, &self.src_expr(&info.version, "pkgs.lib.fakeHash"));
        let src_hash =
            compute_fixed_output_hash(&self.name, &src_probe, Vec::new(), ctx, events).await?;

        let src = self.src_expr(&info.version, &format!("\"{src_hash}\""));
        let vendor_probe = with_pkgs(
            &nixpkgs,
            &format!(
                "pkgs.rustPlatform.fetchCargoVendor {{ src = {src}; hash = pkgs.lib.fakeHash; }}"
            ),
        );
        let cargo_hash =
            compute_fixed_output_hash(&self.name, &vendor_probe, Vec::new(), ctx, events).await?;

        Ok(HashCollection::Entries(vec![
            HashEntry::new(HashType::SrcHash, src_hash)?,
            HashEntry::new(HashType::CargoHash, cargo_hash)?,
        ]))
    }
}
