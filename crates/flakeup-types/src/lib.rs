//! Source manifest and hash model for flakeup.
//!
//! This crate defines the on-disk `sources.json` schema — structured hash
//! entries, the two-shape hash collection, and per-package source entries —
//! together with the merge algebra the update engine relies on and the
//! atomic writer used for every manifest write.
//!
//! # Example
//!
//! ```
//! use flakeup_types::{HashEntry, HashType, HashCollection, SourceEntry};
//!
//! let entry = HashEntry::new(
//!     HashType::VendorHash,
//!     "sha256-4TE4PIBEUDUalSRf8yPdc8fM7E7fRJsODG+1DgxhDEo=",
//! )
//! .expect("valid SRI digest");
//!
//! let source = SourceEntry::new(HashCollection::Entries(vec![entry]))
//!     .with_version("1.2.3");
//! assert_eq!(source.version.as_deref(), Some("1.2.3"));
//! ```

mod error;
mod hash;
mod sources;
mod write;

pub use error::UpdateError;
pub use hash::{
    DEFAULT_FAKE_HASH, HashAlgorithm, HashCollection, HashEntry, HashType, SourceHashes,
    fake_hash_sentinel, is_sri, validate_sri_sha256,
};
pub use sources::{SourceEntry, SourcesFile};
pub use write::{atomic_write, canonical_json_bytes};
