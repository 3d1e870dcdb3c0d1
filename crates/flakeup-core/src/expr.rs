//! Nix expression builders.
//!
//! Expressions are assembled as compact single-line strings so command
//! echoes and logs stay readable.

use flakeup_flake_lock::{FlakeLock, LockedRef};
use flakeup_types::UpdateError;

use crate::paths::RepoPaths;

/// Collapse an expression to a single line with single spaces.
pub fn compact_nix_expr(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build a `builtins.fetchTree` expression from a locked flake node.
pub fn fetch_tree_expr(locked: &LockedRef) -> Result<String, UpdateError> {
    if !matches!(locked.ref_type.as_str(), "github" | "gitlab") {
        return Err(UpdateError::FlakeLock(format!(
            "unsupported flake input type: {}",
            locked.ref_type
        )));
    }
    let (Some(owner), Some(repo), Some(rev)) = (&locked.owner, &locked.repo, &locked.rev) else {
        return Err(UpdateError::FlakeLock(format!(
            "incomplete locked ref for {}: missing owner/repo/rev",
            locked.ref_type
        )));
    };
    Ok(format!(
        r#"builtins.fetchTree {{ type = "{}"; owner = "{owner}"; repo = "{repo}"; rev = "{rev}"; narHash = "{}"; }}"#,
        locked.ref_type, locked.nar_hash
    ))
}

/// Build a nixpkgs import expression from the pinned flake input.
pub fn nixpkgs_expr(lock: &FlakeLock) -> Result<String, UpdateError> {
    let node_name = lock.resolve_node_name("nixpkgs").unwrap_or("nixpkgs");
    let node = lock.node(node_name)?;
    let locked = node.locked.as_ref().ok_or_else(|| {
        UpdateError::FlakeLock("nixpkgs input has no locked reference".to_string())
    })?;
    let fetch = fetch_tree_expr(locked)?;
    Ok(compact_nix_expr(&format!(
        "import ({fetch}) {{ system = builtins.currentSystem; }}"
    )))
}

/// Wrap an expression body in `let pkgs = <nixpkgs>; in <body>`.
pub fn with_pkgs(nixpkgs: &str, body: &str) -> String {
    compact_nix_expr(&format!("let pkgs = {nixpkgs}; in {body}"))
}

/// Build the expression that evaluates an overlay package.
///
/// Applies the flake overlay through a manual fixed point
/// (`lib.fix (self: pkgs // overlay self pkgs)`) instead of
/// `import nixpkgs {{ overlays = [ ... ]; }}`. The normal path triggers
/// `with self;` in nixpkgs' aliases module, which re-enters the overlay
/// before its attributes are defined and recurses forever on current
/// nixpkgs revisions. The fixed point builds the self-referential set
/// outside nixpkgs' own overlay machinery, so the overlay's `final`
/// argument resolves without touching the alias path.
pub fn overlay_expr(paths: &RepoPaths, source: &str, system: Option<&str>) -> String {
    let system_nix = match system {
        Some(system) => format!("\"{system}\""),
        None => "builtins.currentSystem".to_string(),
    };
    let flake_url = format!("git+file://{}?dirty=1", paths.root().display());
    compact_nix_expr(&format!(
        r#"let
             flake = builtins.getFlake "{flake_url}";
             system = {system_nix};
             pkgs = import flake.inputs.nixpkgs {{
               inherit system;
               config = {{ allowUnfree = true; allowInsecurePredicate = _: true; }};
             }};
             applied = pkgs.lib.fix (self: pkgs // flake.overlays.default self pkgs);
           in applied."{source}""#
    ))
}

/// Append a sub-attribute path to an overlay package expression,
/// parenthesized so the access binds to the whole expression.
pub fn overlay_attr_expr(paths: &RepoPaths, source: &str, attr: &str, system: Option<&str>) -> String {
    format!("({}){attr}", overlay_expr(paths, source, system))
}

/// Build a `builtins.fetchGit` narHash probe for a pinned revision.
pub fn fetch_git_nar_hash_expr(url: &str, rev: &str) -> String {
    compact_nix_expr(&format!(
        r#"(builtins.fetchGit {{ url = "{url}"; rev = "{rev}"; allRefs = true; }}).narHash"#
    ))
}
