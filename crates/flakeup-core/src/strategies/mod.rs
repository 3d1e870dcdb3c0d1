//! Hash-computation strategies.
//!
//! Each strategy takes a package name and reports through an event
//! stream; the final value is a single SRI digest or a digest map. No
//! strategy writes the source manifest itself, with one deliberate
//! exception: the platform-sharded flow, which must stage temporary
//! entries in the real per-package file for the build tool to read.

pub mod cargo_lock;
pub mod deno;
pub mod fixed_output;
pub mod urls;
pub mod warm;

pub use cargo_lock::{
    CargoLockGitDep, compute_import_cargo_lock_output_hashes, parse_cargo_lock_git_sources,
};
pub use deno::compute_deno_deps_hashes;
pub use fixed_output::{
    FIXED_OUTPUT_NOISE, compute_drv_fingerprint, compute_fixed_output_hash, compute_overlay_hash,
};
pub use urls::compute_url_hashes;
pub use warm::{WarmSummary, warm_fod_cache};
