//! Error taxonomy shared across the update engine.

use thiserror::Error;

/// Semantic error kinds raised during an update run.
///
/// Per-source failures (network, command, extraction, timeout) surface as
/// ERROR events and never abort other sources. [`UpdateError::Validation`]
/// is fatal at load time; [`UpdateError::FlakeLock`] is fatal for the
/// source that needed the lock entry.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Unclassified failure; the catch-all for unexpected conditions.
    #[error("{0}")]
    Update(String),

    /// HTTP request failed after retries, timed out, or refused to connect.
    #[error("request to {url} failed: {message}")]
    Network {
        url: String,
        message: String,
        status: Option<u16>,
    },

    /// Forge API rate limit exceeded; carries the reset time when known.
    #[error("rate limit exceeded for {url} (resets at {})", .reset.as_deref().unwrap_or("unknown"))]
    RateLimit { url: String, reset: Option<String> },

    /// Subprocess exited non-zero and the caller did not allow failure.
    #[error("command failed with exit code {code}: {command}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The build tool failed but its output contained no recognizable
    /// hash-mismatch message. The message carries a tail of the output.
    #[error("{message}")]
    HashExtraction { message: String },

    /// On-disk data violated a model constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    /// flake.lock could not be parsed or a lookup failed.
    #[error("flake.lock error: {0}")]
    FlakeLock(String),

    /// Wall-clock timeout exceeded for a subprocess.
    #[error("command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// The task was cancelled before it produced a result.
    #[error("Operation cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Create the catch-all variant from any displayable message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Update(msg.into())
    }
}

impl From<anyhow::Error> for UpdateError {
    fn from(err: anyhow::Error) -> Self {
        Self::Update(format!("{err:#}"))
    }
}
