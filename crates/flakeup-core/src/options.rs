//! Typed options for an update run. The command-line surface lives
//! above this crate and hands one of these down.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::refs::FlakeInputRef;

/// What to update and how.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Restrict the run to one source or input name.
    pub source: Option<String>,
    /// Skip the ref-update phase.
    pub no_refs: bool,
    /// Skip the sources phase.
    pub no_sources: bool,
    /// Skip refreshing flake-input lock entries before hashing.
    pub no_input: bool,
    /// Dry run: report available updates without writing anything.
    pub check: bool,
    /// Compute hashes for the current platform only, preserving other
    /// platforms' digests from disk. Implies skipping the refs phase.
    pub native_only: bool,
    /// Pinned versions by source name (CI mode); bypasses fetch-latest.
    pub pinned_versions: BTreeMap<String, String>,
}

/// The targets a run would operate on, for callers to render.
#[derive(Debug, Clone, Serialize)]
pub struct ListTargets {
    pub sources: Vec<String>,
    pub inputs: Vec<FlakeInputRef>,
}
