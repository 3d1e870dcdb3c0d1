//! Build-tool subcommand wrappers.
//!
//! Each wrapper streams lifecycle events through the caller's
//! [`EventSender`] and returns a typed result. The binary can be
//! overridden with `FLAKEUP_NIX_BIN` (and `FLAKEUP_NIX_PREFETCH_BIN` for
//! the prefetch helper) so tests and wrapped installations keep working.

use std::time::Duration;

use flakeup_config::UpdateConfig;
use flakeup_events::{CommandOutcome, EventSender};
use flakeup_process::{CommandSpec, stream_command};
use flakeup_types::UpdateError;

/// Resolve the build tool binary.
pub fn nix_program() -> String {
    std::env::var("FLAKEUP_NIX_BIN").unwrap_or_else(|_| "nix".to_string())
}

fn prefetch_program() -> String {
    std::env::var("FLAKEUP_NIX_PREFETCH_BIN").unwrap_or_else(|_| "nix-prefetch-url".to_string())
}

fn store_program() -> String {
    std::env::var("FLAKEUP_NIX_STORE_BIN").unwrap_or_else(|_| "nix-store".to_string())
}

/// Knobs for a build invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub allow_failure: bool,
    pub verbose: bool,
    pub env: Vec<(String, String)>,
    pub suppress_patterns: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Run `nix build -L [--verbose] --no-link --impure --expr <expr>`.
///
/// The outcome is returned for any exit status; solicited mismatch
/// failures are the caller's success path.
pub async fn nix_build(
    source: &str,
    expr: &str,
    options: BuildOptions,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<CommandOutcome, UpdateError> {
    let mut args = vec![nix_program(), "build".to_string(), "-L".to_string()];
    if options.verbose {
        args.push("--verbose".to_string());
    }
    args.extend(
        ["--no-link", "--impure", "--expr", expr]
            .iter()
            .map(|s| s.to_string()),
    );

    let mut spec = CommandSpec::new(args);
    spec.allow_failure = options.allow_failure;
    spec.suppress_patterns = options.suppress_patterns;
    spec.env = options.env;
    spec.timeout = options.timeout;
    let outcome = stream_command(spec, source, config, events).await?;
    if !options.allow_failure {
        outcome.ensure_success()?;
    }
    Ok(outcome)
}

/// Run `nix eval --json [--impure] --expr <expr>` and parse the payload.
pub async fn nix_eval_json(
    source: &str,
    expr: &str,
    impure: bool,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<serde_json::Value, UpdateError> {
    let mut args = vec![nix_program(), "eval".to_string(), "--json".to_string()];
    if impure {
        args.push("--impure".to_string());
    }
    args.push("--expr".to_string());
    args.push(expr.to_string());

    let outcome = stream_command(CommandSpec::new(args), source, config, events).await?;
    outcome.ensure_success()?;
    serde_json::from_str(&outcome.stdout)
        .map_err(|err| UpdateError::message(format!("nix eval returned invalid JSON: {err}")))
}

/// Run `nix derivation show --quiet --impure --expr <expr>`.
pub async fn derivation_show(
    source: &str,
    expr: &str,
    env: Vec<(String, String)>,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<serde_json::Value, UpdateError> {
    let args = vec![
        nix_program(),
        "derivation".to_string(),
        "show".to_string(),
        "--quiet".to_string(),
        "--impure".to_string(),
        "--expr".to_string(),
        expr.to_string(),
    ];
    let mut spec = CommandSpec::new(args);
    spec.env = env;
    let outcome = stream_command(spec, source, config, events).await?;
    outcome.ensure_success()?;
    serde_json::from_str(&outcome.stdout).map_err(|err| {
        UpdateError::message(format!("nix derivation show returned invalid JSON: {err}"))
    })
}

/// Extract the derivation fingerprint from `nix derivation show` output:
/// the leading hash of the first `.drv` store path, with newer tool
/// versions' `derivations` sub-object handled transparently.
pub fn drv_fingerprint_from_show(payload: &serde_json::Value) -> Result<String, UpdateError> {
    let map = match payload.get("derivations") {
        Some(serde_json::Value::Object(inner)) => inner,
        _ => payload
            .as_object()
            .ok_or_else(|| UpdateError::message("nix derivation show returned no object"))?,
    };
    let drv_path = map
        .keys()
        .next()
        .ok_or_else(|| UpdateError::message("nix derivation show returned no derivations"))?;

    // The key is "<hash>-<name>.drv" on newer tools, or the full
    // "/nix/store/<hash>-<name>.drv" on older ones.
    let file = drv_path.rsplit('/').next().unwrap_or(drv_path);
    let fingerprint = file.split('-').next().unwrap_or(file);
    if fingerprint.is_empty() {
        return Err(UpdateError::message(format!(
            "unexpected derivation path: {drv_path}"
        )));
    }
    Ok(fingerprint.to_string())
}

/// Run `nix hash convert --hash-algo sha256 --to sri <hash>`.
pub async fn hash_convert(
    source: &str,
    hash: &str,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<String, UpdateError> {
    let args = vec![
        nix_program(),
        "hash".to_string(),
        "convert".to_string(),
        "--hash-algo".to_string(),
        "sha256".to_string(),
        "--to".to_string(),
        "sri".to_string(),
        hash.to_string(),
    ];
    let outcome = stream_command(CommandSpec::new(args), source, config, events).await?;
    outcome.ensure_success()?;
    let sri = outcome.stdout.trim().to_string();
    if sri.is_empty() {
        return Err(UpdateError::message("nix hash convert returned no output"));
    }
    Ok(sri)
}

/// Prefetch a URL and return its digest as SRI.
///
/// `nix-prefetch-url` prints a Nix-base32 hash; the result is piped
/// through hash conversion so callers only ever see SRI.
pub async fn prefetch_url(
    source: &str,
    url: &str,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<String, UpdateError> {
    let args = vec![
        prefetch_program(),
        "--type".to_string(),
        "sha256".to_string(),
        url.to_string(),
    ];
    let outcome = stream_command(CommandSpec::new(args), source, config, events).await?;
    outcome.ensure_success()?;
    let nix32 = outcome
        .stdout
        .lines()
        .last()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| UpdateError::message(format!("prefetch returned no hash for {url}")))?
        .to_string();
    hash_convert(source, &nix32, config, events).await
}

/// Run `nix flake lock --update-input <name>`.
///
/// The only sanctioned way this engine mutates the lock file.
pub async fn flake_lock_update(
    source: &str,
    input_name: &str,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<(), UpdateError> {
    let args = vec![
        nix_program(),
        "flake".to_string(),
        "lock".to_string(),
        "--update-input".to_string(),
        input_name.to_string(),
    ];
    let outcome = stream_command(CommandSpec::new(args), source, config, events).await?;
    outcome.ensure_success()
}

/// Run `nix build --dry-run` and return the derivations that would be
/// built.
pub async fn nix_build_dry_run(
    source: &str,
    expr: &str,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<Vec<String>, UpdateError> {
    let args = vec![
        nix_program(),
        "build".to_string(),
        "--dry-run".to_string(),
        "--impure".to_string(),
        "--expr".to_string(),
        expr.to_string(),
    ];
    let mut spec = CommandSpec::new(args);
    // Dry-run reports through stderr and may exit non-zero while still
    // printing the plan.
    spec.allow_failure = true;
    let outcome = stream_command(spec, source, config, events).await?;
    let combined = outcome.combined_output();
    if !outcome.succeeded() && !combined.contains("will be built:") {
        return Err(UpdateError::Command {
            command: outcome.args.join(" "),
            code: outcome.returncode,
            stderr: outcome.stderr.trim_end().to_string(),
        });
    }
    Ok(parse_dry_run_derivations(&combined))
}

/// Parse derivation paths listed under the "will be built:" heading.
pub fn parse_dry_run_derivations(output: &str) -> Vec<String> {
    let mut derivations = Vec::new();
    let mut in_section = false;
    for line in output.lines() {
        if line.contains("will be built:") {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with('/') && trimmed.ends_with(".drv") {
            derivations.push(trimmed.to_string());
        } else if !trimmed.is_empty() {
            // Next heading ("will be fetched:" etc.) ends the section.
            in_section = false;
        }
    }
    derivations
}

/// Realise already-evaluated derivations with `nix-store --realise`.
pub async fn store_realise(
    source: &str,
    drv_paths: &[String],
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<(), UpdateError> {
    if drv_paths.is_empty() {
        return Ok(());
    }
    let mut args = vec![store_program(), "--realise".to_string()];
    args.extend(drv_paths.iter().cloned());
    let outcome = stream_command(CommandSpec::new(args), source, config, events).await?;
    outcome.ensure_success()
}
