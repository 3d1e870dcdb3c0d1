//! Fixed-output hashes via deliberate mismatch, overlay evaluation, and
//! the derivation fingerprint.

use flakeup_events::{CommandOutcome, EventSender, channel};
use flakeup_nix::{BuildOptions, derivation_show, drv_fingerprint_from_show, extract_got_hash, nix_build};
use flakeup_types::UpdateError;

use crate::context::RunContext;
use crate::expr::{compact_nix_expr, overlay_expr};

/// Log noise suppressed while soliciting a mismatch; the failure itself
/// is the success path, so these lines only alarm readers.
pub const FIXED_OUTPUT_NOISE: [&str; 7] = [
    "error: hash mismatch in fixed-output derivation",
    "specified:",
    "got:",
    "error: Cannot build",
    "Reason:",
    "Output paths:",
    "error: Build failed due to failed dependency",
];

/// Run a build expected to fail with a hash mismatch. A build that
/// *succeeds* means the sentinel never reached the derivation.
pub(crate) async fn run_fixed_output_build(
    source: &str,
    expr: &str,
    env: Vec<(String, String)>,
    success_error: &str,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<CommandOutcome, UpdateError> {
    let outcome = nix_build(
        source,
        expr,
        BuildOptions {
            allow_failure: true,
            verbose: true,
            env,
            suppress_patterns: FIXED_OUTPUT_NOISE.iter().map(|s| s.to_string()).collect(),
            timeout: None,
        },
        &ctx.config,
        events,
    )
    .await?;
    if outcome.succeeded() {
        return Err(UpdateError::message(success_error));
    }
    Ok(outcome)
}

/// Compute an SRI hash by provoking a fixed-output mismatch and
/// extracting the "got" digest.
pub async fn compute_fixed_output_hash(
    source: &str,
    expr: &str,
    env: Vec<(String, String)>,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<String, UpdateError> {
    let expr = compact_nix_expr(expr);
    let _permit = ctx.acquire_build_permit().await?;
    let outcome = run_fixed_output_build(
        source,
        &expr,
        env,
        "expected the build to fail with a hash mismatch, but it succeeded",
        ctx,
        events,
    )
    .await?;
    let mismatch = extract_got_hash(&outcome.combined_output(), &ctx.config)?;
    mismatch.to_sri(source, &ctx.config, events).await
}

/// Compute a hash by building the overlay package with `FAKE_HASHES=1`,
/// so the overlay substitutes the sentinel for the field being solved.
pub async fn compute_overlay_hash(
    source: &str,
    package: &str,
    system: Option<&str>,
    ctx: &RunContext,
    events: &EventSender,
) -> Result<String, UpdateError> {
    let expr = overlay_expr(&ctx.paths, package, system);
    compute_fixed_output_hash(
        source,
        &expr,
        vec![("FAKE_HASHES".to_string(), "1".to_string())],
        ctx,
        events,
    )
    .await
}

/// Compute the derivation fingerprint used for staleness detection.
///
/// Evaluates the package with the sentinel substituted and takes the
/// leading hash of the `.drv` store path. Because the sentinel is a
/// constant, the result is a pure function of the entire transitive
/// build-input closure: any nixpkgs bump, toolchain change, source
/// force-push, or build-script edit changes it, and identical inputs
/// never do.
pub async fn compute_drv_fingerprint(
    source: &str,
    system: Option<&str>,
    ctx: &RunContext,
) -> Result<String, UpdateError> {
    let expr = overlay_expr(&ctx.paths, source, system);
    // Fingerprint evaluation is chatty and purely internal; discard its
    // command stream instead of forwarding it.
    let (discard, _rx) = channel();
    let payload = derivation_show(
        source,
        &expr,
        vec![("FAKE_HASHES".to_string(), "1".to_string())],
        &ctx.config,
        &discard,
    )
    .await?;
    drv_fingerprint_from_show(&payload)
}
