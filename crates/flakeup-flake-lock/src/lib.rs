//! Read-only model of the build tool's `flake.lock` file.
//!
//! The lock file is a graph: a root node whose `inputs` map names either
//! target nodes directly or follow-through paths that must be walked
//! through each intermediate node's inputs. This engine never mutates the
//! lock file itself; rewrites go through `nix flake lock --update-input`.
//!
//! # Example
//!
//! ```
//! use flakeup_flake_lock::FlakeLock;
//!
//! let lock = FlakeLock::from_json(r#"{
//!   "nodes": {
//!     "nixpkgs": {
//!       "locked": {"type": "github", "owner": "NixOS", "repo": "nixpkgs",
//!                  "rev": "0000000000000000000000000000000000000000",
//!                  "narHash": "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="},
//!       "original": {"type": "github", "owner": "NixOS", "repo": "nixpkgs"}
//!     },
//!     "root": {"inputs": {"nixpkgs": "nixpkgs"}}
//!   },
//!   "root": "root",
//!   "version": 7
//! }"#).expect("valid lock");
//!
//! assert_eq!(lock.input_names(), vec!["nixpkgs"]);
//! assert!(lock.get_locked("nixpkgs").is_some());
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use flakeup_types::UpdateError;

/// A fully-resolved ("locked") flake input reference.
///
/// Different source types (github, gitlab, git, path, tarball, ...)
/// populate different subsets of these fields; unknown fields are ignored
/// so newer fetchers keep parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct LockedRef {
    /// Source type: `github`, `gitlab`, `git`, `path`, `tarball`, etc.
    #[serde(rename = "type")]
    pub ref_type: String,
    /// SRI content hash of the fetched tree.
    #[serde(rename = "narHash")]
    pub nar_hash: String,
    /// Git revision (full SHA-1 hex digest).
    pub rev: Option<String>,
    /// Unix timestamp of the locked commit or file.
    #[serde(rename = "lastModified")]
    pub last_modified: Option<i64>,
    /// Repository owner (github/gitlab types).
    pub owner: Option<String>,
    /// Repository name (github/gitlab types).
    pub repo: Option<String>,
    /// Source URL (git/tarball types).
    pub url: Option<String>,
    /// Git branch or tag name.
    pub r#ref: Option<String>,
    /// Filesystem path (path type).
    pub path: Option<String>,
    /// Number of ancestor commits (set by some fetchers).
    #[serde(rename = "revCount")]
    pub rev_count: Option<u64>,
}

/// The user-specified ("original") flake input reference: the
/// human-authored spec before resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct OriginalRef {
    #[serde(rename = "type")]
    pub ref_type: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub url: Option<String>,
    pub r#ref: Option<String>,
    pub rev: Option<String>,
    pub path: Option<String>,
}

/// An input value: a plain node name or a follow-through path.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputRef {
    Direct(String),
    Follow(Vec<String>),
}

/// A single node in the lock graph. The root node carries only `inputs`;
/// leaf nodes carry `locked` and `original`.
#[derive(Debug, Clone, Deserialize)]
pub struct FlakeLockNode {
    pub locked: Option<LockedRef>,
    pub original: Option<OriginalRef>,
    pub inputs: Option<BTreeMap<String, InputRef>>,
    /// Explicitly `false` for non-flake inputs; omitted when `true`.
    pub flake: Option<bool>,
}

impl FlakeLockNode {
    /// Extract a display version: original ref, else original rev, else
    /// locked rev, else "unknown".
    pub fn version(&self) -> String {
        if let Some(original) = &self.original {
            if let Some(r) = &original.r#ref {
                return r.clone();
            }
            if let Some(rev) = &original.rev {
                return rev.clone();
            }
        }
        self.locked
            .as_ref()
            .and_then(|locked| locked.rev.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Top-level `flake.lock` representation.
#[derive(Debug, Clone, Deserialize)]
pub struct FlakeLock {
    pub nodes: BTreeMap<String, FlakeLockNode>,
    #[serde(default = "default_root")]
    pub root: String,
    pub version: u32,
}

fn default_root() -> String {
    "root".to_string()
}

impl FlakeLock {
    /// Read and parse a `flake.lock` file.
    pub fn from_file(path: &Path) -> Result<Self, UpdateError> {
        let text = fs::read_to_string(path).map_err(|err| {
            UpdateError::FlakeLock(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Parse from raw JSON text.
    pub fn from_json(text: &str) -> Result<Self, UpdateError> {
        let lock: FlakeLock = serde_json::from_str(text)
            .map_err(|err| UpdateError::FlakeLock(format!("failed to parse flake.lock: {err}")))?;
        if !lock.nodes.contains_key(&lock.root) {
            return Err(UpdateError::FlakeLock(format!(
                "flake.lock has no root node {:?}",
                lock.root
            )));
        }
        Ok(lock)
    }

    /// The root node of the dependency graph.
    pub fn root_node(&self) -> &FlakeLockNode {
        &self.nodes[&self.root]
    }

    /// Sorted list of the root node's direct input names.
    pub fn input_names(&self) -> Vec<&str> {
        match &self.root_node().inputs {
            Some(inputs) => inputs.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    /// Look up a node by its internal name.
    pub fn node(&self, name: &str) -> Result<&FlakeLockNode, UpdateError> {
        self.nodes
            .get(name)
            .ok_or_else(|| UpdateError::FlakeLock(format!("input {name:?} not found in flake.lock")))
    }

    /// Resolve a root-level input name to the node it targets, walking
    /// follow-through paths through each intermediate node's inputs.
    pub fn resolve_node_name(&self, input_name: &str) -> Option<&str> {
        let inputs = self.root_node().inputs.as_ref()?;
        match inputs.get(input_name)? {
            InputRef::Direct(name) => Some(name),
            InputRef::Follow(path) => {
                let mut segments = path.iter();
                let mut current = segments.next()?.as_str();
                for segment in segments {
                    let node = self.nodes.get(current)?;
                    match node.inputs.as_ref()?.get(segment)? {
                        InputRef::Direct(next) => current = next,
                        InputRef::Follow(_) => return None,
                    }
                }
                Some(current)
            }
        }
    }

    /// Resolve a root-level input name to its locked reference, or `None`
    /// when the input or its target node has no `locked` field.
    pub fn get_locked(&self, input_name: &str) -> Option<&LockedRef> {
        let node_name = self.resolve_node_name(input_name)?;
        self.nodes.get(node_name)?.locked.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAR: &str = "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    fn sample_lock() -> FlakeLock {
        FlakeLock::from_json(&format!(
            r#"{{
              "nodes": {{
                "nixpkgs": {{
                  "locked": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                             "rev": "0000000000000000000000000000000000000000",
                             "lastModified": 1700000000, "narHash": "{NAR}"}},
                  "original": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                               "ref": "nixos-unstable"}}
                }},
                "editor": {{
                  "inputs": {{"nixpkgs": "nixpkgs_2"}},
                  "locked": {{"type": "github", "owner": "acme", "repo": "editor",
                             "rev": "1111111111111111111111111111111111111111",
                             "narHash": "{NAR}"}},
                  "original": {{"type": "github", "owner": "acme", "repo": "editor",
                               "ref": "v1.2.3"}}
                }},
                "nixpkgs_2": {{
                  "locked": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs",
                             "rev": "2222222222222222222222222222222222222222",
                             "narHash": "{NAR}"}},
                  "original": {{"type": "github", "owner": "NixOS", "repo": "nixpkgs"}}
                }},
                "root": {{
                  "inputs": {{
                    "nixpkgs": "nixpkgs",
                    "editor": "editor",
                    "editor-nixpkgs": ["editor", "nixpkgs"]
                  }}
                }}
              }},
              "root": "root",
              "version": 7
            }}"#
        ))
        .expect("valid lock")
    }

    #[test]
    fn input_names_are_sorted() {
        let lock = sample_lock();
        assert_eq!(lock.input_names(), vec!["editor", "editor-nixpkgs", "nixpkgs"]);
    }

    #[test]
    fn direct_input_resolves_to_locked_ref() {
        let lock = sample_lock();
        let locked = lock.get_locked("nixpkgs").expect("locked ref");
        assert_eq!(locked.owner.as_deref(), Some("NixOS"));
        assert_eq!(
            locked.rev.as_deref(),
            Some("0000000000000000000000000000000000000000")
        );
    }

    #[test]
    fn follow_path_walks_intermediate_inputs() {
        let lock = sample_lock();
        let locked = lock.get_locked("editor-nixpkgs").expect("locked ref");
        assert_eq!(
            locked.rev.as_deref(),
            Some("2222222222222222222222222222222222222222")
        );
    }

    #[test]
    fn unknown_input_resolves_to_none() {
        let lock = sample_lock();
        assert!(lock.get_locked("missing").is_none());
    }

    #[test]
    fn all_non_root_nodes_carry_locked_refs() {
        let lock = sample_lock();
        for (name, node) in &lock.nodes {
            if name != &lock.root {
                assert!(node.locked.is_some(), "node {name} should be locked");
            }
        }
    }

    #[test]
    fn version_prefers_original_ref() {
        let lock = sample_lock();
        assert_eq!(lock.node("editor").unwrap().version(), "v1.2.3");
        assert_eq!(
            lock.node("nixpkgs_2").unwrap().version(),
            "2222222222222222222222222222222222222222"
        );
    }

    #[test]
    fn missing_root_node_is_an_error() {
        let err = FlakeLock::from_json(r#"{"nodes": {}, "root": "root", "version": 7}"#)
            .expect_err("no root");
        assert!(matches!(err, UpdateError::FlakeLock(_)));
    }

    #[test]
    fn from_file_reports_read_failures() {
        let err = FlakeLock::from_file(Path::new("/nonexistent/flake.lock")).expect_err("missing");
        assert!(matches!(err, UpdateError::FlakeLock(_)));
    }

    #[test]
    fn parses_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flake.lock");
        std::fs::write(
            &path,
            r#"{"nodes": {"root": {"inputs": {}}}, "root": "root", "version": 7}"#,
        )
        .unwrap();
        let lock = FlakeLock::from_file(&path).unwrap();
        assert!(lock.input_names().is_empty());
    }
}
