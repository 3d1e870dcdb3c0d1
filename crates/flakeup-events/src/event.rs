//! The event record emitted by update tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use flakeup_types::{HashCollection, SourceEntry};

/// Kinds of events emitted by update tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Human-readable progress text.
    Status,
    /// A subprocess is about to run; message carries the rendered argv.
    CommandStart,
    /// One sanitized output line from a running subprocess.
    Line,
    /// A subprocess finished; payload carries the [`CommandOutcome`].
    CommandEnd,
    /// A typed intermediate result for combinators to capture.
    Value,
    /// Terminal event: payload is the new entry / ref update, or absent
    /// when nothing changed.
    Result,
    /// Terminal failure for this source.
    Error,
}

/// Which pipe a subprocess line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
        }
    }
}

/// Result payload for a completed subprocess command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub args: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub allow_failure: bool,
    /// Last lines of combined output, retained only for build commands.
    pub tail_lines: Vec<String>,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.returncode == 0
    }

    /// Error out unless the command exited zero or failure was allowed.
    pub fn ensure_success(&self) -> Result<(), flakeup_types::UpdateError> {
        if self.succeeded() || self.allow_failure {
            Ok(())
        } else {
            Err(flakeup_types::UpdateError::Command {
                command: self.args.join(" "),
                code: self.returncode,
                stderr: self.stderr.trim_end().to_string(),
            })
        }
    }

    /// Both pipes concatenated, stderr first — mismatch messages may land
    /// on either depending on tool version.
    pub fn combined_output(&self) -> String {
        format!("{}{}", self.stderr, self.stdout)
    }
}

/// Typed payloads a VALUE or RESULT event can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Raw argv of a starting command.
    Args(Vec<String>),
    /// A finished subprocess.
    Command(CommandOutcome),
    /// A single string value, usually an SRI digest.
    Text(String),
    /// One `(platform, digest)` pair from a sharded computation.
    PlatformHash(String, String),
    /// A string-to-string map (URL → digest, platform → digest, ...).
    Map(BTreeMap<String, String>),
    /// A finished hash collection.
    Hashes(HashCollection),
    /// A finished source entry.
    Entry(SourceEntry),
    /// A flake ref moved from `current` to `latest`.
    RefUpdate { current: String, latest: String },
}

impl EventPayload {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            EventPayload::Args(_) => "args",
            EventPayload::Command(_) => "command",
            EventPayload::Text(_) => "text",
            EventPayload::PlatformHash(_, _) => "platform hash",
            EventPayload::Map(_) => "map",
            EventPayload::Hashes(_) => "hashes",
            EventPayload::Entry(_) => "entry",
            EventPayload::RefUpdate { .. } => "ref update",
        }
    }
}

/// Single event emitted during update processing.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub source: String,
    pub kind: EventKind,
    pub message: Option<String>,
    pub stream: Option<StreamLabel>,
    pub payload: Option<EventPayload>,
}

impl UpdateEvent {
    pub fn status(source: &str, message: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::Status,
            message: Some(message.into()),
            stream: None,
            payload: None,
        }
    }

    pub fn error(source: &str, message: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::Error,
            message: Some(message.into()),
            stream: None,
            payload: None,
        }
    }

    pub fn value(source: &str, payload: EventPayload) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::Value,
            message: None,
            stream: None,
            payload: Some(payload),
        }
    }

    pub fn result(source: &str, payload: Option<EventPayload>) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::Result,
            message: None,
            stream: None,
            payload,
        }
    }

    pub fn command_start(source: &str, rendered: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::CommandStart,
            message: Some(rendered.into()),
            stream: None,
            payload: Some(EventPayload::Args(args)),
        }
    }

    pub fn line(source: &str, text: impl Into<String>, stream: StreamLabel) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::Line,
            message: Some(text.into()),
            stream: Some(stream),
            payload: None,
        }
    }

    pub fn command_end(source: &str, outcome: CommandOutcome) -> Self {
        Self {
            source: source.to_string(),
            kind: EventKind::CommandEnd,
            message: None,
            stream: None,
            payload: Some(EventPayload::Command(outcome)),
        }
    }
}
