//! Hash-mismatch extraction from builder error output.
//!
//! Provoking a mismatch and scraping the "got" digest is the success path
//! of hash computation, not error recovery. This module is the single
//! extraction site; any call site running its own regex is a bug.

use std::sync::LazyLock;

use regex::Regex;

use flakeup_config::UpdateConfig;
use flakeup_events::EventSender;
use flakeup_types::{UpdateError, is_sri};

const ALGOS: &str = "(?:blake3|md5|sha1|sha256|sha512)";

// SRI format from derivation-check.cc, e.g.
// got: sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=
static RE_SRI_GOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"got:\s*({ALGOS}-[A-Za-z0-9+/]+=*)")).unwrap());
static RE_SRI_SPECIFIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"specified:\s*({ALGOS}-[A-Za-z0-9+/]+=*)")).unwrap());

// Fallbacks from local-store.cc: algo-prefixed hex, bare hex
// (40=sha1, 64=sha256, 128=sha512), or Nix-base32 (32-char alphabet
// excluding e/o/t/u; sha1=32, sha256=52, sha512=103 chars).
static RE_FALLBACK_GOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"got:\s*({ALGOS}:[0-9a-fA-F]+|[0-9a-fA-F]{{40,128}}|[0-9a-df-np-sv-z]{{32,103}})"
    ))
    .unwrap()
});
static RE_FALLBACK_SPECIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"specified:\s*({ALGOS}:[0-9a-fA-F]+|[0-9a-fA-F]{{40,128}}|[0-9a-df-np-sv-z]{{32,103}})"
    ))
    .unwrap()
});

// Matches both "hash mismatch in fixed-output derivation" and
// "(ca) hash mismatch importing path".
static RE_DRV_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:hash mismatch in fixed-output derivation|(?:ca )?hash mismatch importing path)\s+'([^']+)'",
    )
    .unwrap()
});

const MISMATCH_INDICATORS: [&str; 3] = ["hash mismatch", "HashMismatch", "specified:"];

/// A parsed hash-mismatch report from the build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMismatch {
    /// The "got" digest in its original encoding.
    pub got: String,
    /// The "specified" digest, when present.
    pub specified: Option<String>,
    /// The failing derivation or store path, when present.
    pub drv_path: Option<String>,
}

impl HashMismatch {
    /// Try to parse a mismatch from combined builder output.
    ///
    /// `find_iter` takes the **last** match so that nested derivation
    /// failures resolve to the innermost (most relevant) hash. Returns
    /// `None` when the output has no recognizable mismatch.
    pub fn from_output(output: &str) -> Option<Self> {
        let got = last_capture(&RE_SRI_GOT, output)
            .or_else(|| last_capture(&RE_FALLBACK_GOT, output))?;
        let specified = last_capture(&RE_SRI_SPECIFIED, output)
            .or_else(|| last_capture(&RE_FALLBACK_SPECIFIED, output));
        let drv_path = last_capture(&RE_DRV_PATH, output);
        Some(Self {
            got,
            specified,
            drv_path,
        })
    }

    /// Whether the captured digest is already in SRI form.
    pub fn is_sri(&self) -> bool {
        is_sri(&self.got)
    }

    /// Return the got digest as SRI, converting through the build tool's
    /// hash-conversion subcommand when necessary.
    pub async fn to_sri(
        &self,
        source: &str,
        config: &UpdateConfig,
        events: &EventSender,
    ) -> Result<String, UpdateError> {
        if self.is_sri() {
            return Ok(self.got.clone());
        }
        crate::commands::hash_convert(source, &self.got, config, events).await
    }
}

fn last_capture(re: &Regex, output: &str) -> Option<String> {
    re.captures_iter(output)
        .last()
        .map(|caps| caps[1].to_string())
}

/// Extract the "got" digest from builder output or fail with a diagnostic
/// that distinguishes "format changed" from "no mismatch at all".
pub fn extract_got_hash(output: &str, config: &UpdateConfig) -> Result<HashMismatch, UpdateError> {
    if let Some(mismatch) = HashMismatch::from_output(output) {
        return Ok(mismatch);
    }
    let tail = tail_excerpt(output, config.log_tail_lines);
    let message = if MISMATCH_INDICATORS.iter().any(|i| output.contains(i)) {
        format!(
            "hash mismatch detected in build output but the hash could not be \
             extracted; the builder's error format may have changed. Output tail:\n{tail}"
        )
    } else {
        format!("could not find hash in build output. Output tail:\n{tail}")
    };
    Err(UpdateError::HashExtraction { message })
}

fn tail_excerpt(output: &str, max_lines: usize) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return "<no output>".to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() <= max_lines {
        return trimmed.to_string();
    }
    let tail = lines[lines.len() - max_lines..].join("\n");
    format!("... (last {max_lines} of {} lines)\n{tail}", lines.len())
}
