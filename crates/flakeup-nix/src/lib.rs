//! Typed wrappers for the external build tool.
//!
//! Every `nix` invocation the engine makes goes through this crate: build
//! solicitation, JSON evaluation, derivation inspection, hash conversion,
//! URL prefetching, and lock-file updates. The hash-mismatch extractor
//! lives here too and is the single place in the system that parses the
//! builder's error text.

mod commands;
mod mismatch;

pub use commands::{
    BuildOptions, derivation_show, drv_fingerprint_from_show, flake_lock_update, hash_convert,
    nix_build, nix_build_dry_run, nix_eval_json, nix_program, parse_dry_run_derivations,
    prefetch_url, store_realise,
};
pub use mismatch::{HashMismatch, extract_got_hash};
