//! Core library behind the flakeup update engine.
//!
//! Keeps per-package `sources.json` manifests — upstream versions,
//! content-addressed hashes, locked flake revisions — synchronized with
//! the outside world. The engine classifies each target into an operation
//! order, fans work out across bounded concurrency, computes hashes by
//! provoking the build tool into mismatch failures, and persists
//! byte-stable manifests downstream evaluations read at build time.
//!
//! The command-line surface, CI plumbing, and any renderer live above
//! this crate: callers hand [`options::UpdateOptions`] to
//! [`engine::run_updates`] and consume the resulting summary (plus the
//! event stream, if they care to render progress).

pub mod context;
pub mod engine;
pub mod expr;
pub mod lockfile;
pub mod options;
pub mod paths;
pub mod refs;
pub mod registry;
pub mod sources;
pub mod strategies;
pub mod summary;
pub mod tools;
pub mod updater;

pub use context::RunContext;
pub use engine::{list_targets, run_updates, validate_sources};
pub use options::UpdateOptions;
pub use registry::UpdaterRegistry;
pub use summary::{RunReport, SummaryStatus, UpdateSummary};
