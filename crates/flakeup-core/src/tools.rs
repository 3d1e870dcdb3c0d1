//! Required-tool preflight.

use crate::registry::UpdaterRegistry;

/// Tools every mode needs.
pub const REQUIRED_TOOLS: [&str; 1] = ["nix"];

/// Tools a full hash-computing run may need.
pub const ALL_TOOLS: [&str; 2] = ["nix", "nix-prefetch-url"];

/// Return the required CLI tools missing from `$PATH`.
///
/// Refs-only runs need only the build tool (plus the flake editor when
/// rewriting); a single-source run narrows to that updater's declared
/// tools.
pub fn missing_tools(
    registry: &UpdaterRegistry,
    source: Option<&str>,
    needs_sources: bool,
    include_flake_edit: bool,
) -> Vec<String> {
    let mut tools: Vec<String> = if !needs_sources {
        REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect()
    } else if let Some(source) = source {
        match registry.get(source) {
            Some(updater) => updater
                .required_tools()
                .iter()
                .map(|t| t.to_string())
                .collect(),
            None => REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    } else {
        ALL_TOOLS.iter().map(|t| t.to_string()).collect()
    };

    if include_flake_edit {
        tools.push("flake-edit".to_string());
    }

    tools
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}
