//! Subprocess driver: line streaming, sanitation, and wall-clock timeouts.
//!
//! Runs external commands with a deterministic environment (a dumb
//! terminal forced on top of the parent's), streams both pipes
//! line-by-line with ANSI and carriage returns stripped, and kills the
//! child on timeout. Build commands additionally retain a small ring
//! buffer of trailing output so failure diagnostics can be surfaced
//! without keeping the whole log.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use flakeup_config::UpdateConfig;
use flakeup_events::{CommandOutcome, EventSender, StreamLabel, UpdateEvent};
use flakeup_types::UpdateError;

/// Lines of combined output retained for build-failure diagnostics.
pub const BUILD_FAILURE_TAIL_LINES: usize = 20;

const COMMAND_ECHO_MAX_LEN: usize = 80;

/// What to run and how strictly to treat it.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub args: Vec<String>,
    /// Wall-clock limit; falls back to the configured subprocess timeout.
    pub timeout: Option<Duration>,
    /// Extra environment merged over the parent's.
    pub env: Vec<(String, String)>,
    /// When set, a non-zero exit is part of the protocol rather than an
    /// error (hash-mismatch solicitation).
    pub allow_failure: bool,
    /// Substrings whose lines are dropped from events and the tail.
    pub suppress_patterns: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn suppress<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suppress_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// Recognize the build tool's build subcommand, tolerating an absolute
/// path to the binary.
pub fn is_build_command(args: &[String]) -> bool {
    let Some(program) = args.first() else {
        return false;
    };
    let stem = Path::new(program)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(program);
    stem == "nix" && args.get(1).map(String::as_str) == Some("build")
}

/// Strip control characters and ANSI styling from a process line.
pub fn sanitize_log_line(line: &str) -> String {
    let without_cr = line.replace('\r', "");
    console::strip_ansi_codes(&without_cr).into_owned()
}

/// Render argv for the command-start event: shell-ish quoting, escaped
/// newlines, truncated to one echo line.
pub fn render_command(args: &[String]) -> String {
    let joined = args
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || "'\"\\$".contains(c)) {
                format!("'{}'", arg.replace('\'', "'\\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    let escaped = joined
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    if escaped.len() <= COMMAND_ECHO_MAX_LEN {
        return escaped;
    }
    let suffix = " [...]";
    let keep = COMMAND_ECHO_MAX_LEN.saturating_sub(suffix.len());
    let mut cut = keep;
    while cut > 0 && !escaped.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", escaped[..cut].trim_end(), suffix)
}

fn pump<R>(
    reader: Option<R>,
    label: StreamLabel,
    lines: mpsc::UnboundedSender<(StreamLabel, String)>,
) -> tokio::task::JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = String::new();
        let Some(reader) = reader else {
            return collected;
        };
        let mut buf = BufReader::new(reader).lines();
        while let Ok(Some(line)) = buf.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
            if lines.send((label, line)).is_err() {
                break;
            }
        }
        collected
    })
}

/// Run a command, streaming lifecycle events into `events` and returning
/// the completed [`CommandOutcome`].
///
/// The outcome is returned for any exit status; callers decide whether a
/// non-zero exit is an error (`CommandOutcome::ensure_success`) or the
/// expected mismatch path. Timeouts kill the child and surface as
/// [`UpdateError::Timeout`].
pub async fn stream_command(
    spec: CommandSpec,
    source: &str,
    config: &UpdateConfig,
    events: &EventSender,
) -> Result<CommandOutcome, UpdateError> {
    let timeout = spec
        .timeout
        .unwrap_or(Duration::from_secs(config.subprocess_timeout));
    let rendered = render_command(&spec.args);
    events
        .send(UpdateEvent::command_start(
            source,
            rendered.clone(),
            spec.args.clone(),
        ))
        .await;

    let Some((program, rest)) = spec.args.split_first() else {
        return Err(UpdateError::message("cannot run an empty command"));
    };

    let mut command = Command::new(program);
    command
        .args(rest)
        .env("TERM", "dumb")
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| UpdateError::Command {
        command: rendered.clone(),
        code: -1,
        stderr: format!("failed to spawn: {err}"),
    })?;

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let stdout_task = pump(child.stdout.take(), StreamLabel::Stdout, line_tx.clone());
    let stderr_task = pump(child.stderr.take(), StreamLabel::Stderr, line_tx);

    let mut tail: Option<VecDeque<String>> = is_build_command(&spec.args)
        .then(|| VecDeque::with_capacity(BUILD_FAILURE_TAIL_LINES));

    let drive = async {
        while let Some((label, raw)) = line_rx.recv().await {
            let sanitized = sanitize_log_line(raw.trim_end_matches('\n'));
            if sanitized.is_empty() {
                continue;
            }
            if spec
                .suppress_patterns
                .iter()
                .any(|pattern| sanitized.contains(pattern))
            {
                continue;
            }
            if let Some(tail) = tail.as_mut() {
                if tail.len() == BUILD_FAILURE_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(format!("[{}] {}", label.as_str(), sanitized));
            }
            events
                .send(UpdateEvent::line(source, sanitized, label))
                .await;
        }
        child.wait().await
    };

    let status = match tokio::time::timeout(timeout, drive).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            return Err(UpdateError::Command {
                command: rendered,
                code: -1,
                stderr: format!("failed to wait for child: {err}"),
            });
        }
        Err(_) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(UpdateError::Timeout {
                command: format!(
                    "{rendered} (limit {})",
                    humantime::format_duration(timeout)
                ),
                seconds: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let outcome = CommandOutcome {
        args: spec.args,
        returncode: status.code().unwrap_or(-1),
        stdout,
        stderr,
        allow_failure: spec.allow_failure,
        tail_lines: tail.map(Vec::from).unwrap_or_default(),
    };
    events
        .send(UpdateEvent::command_end(source, outcome.clone()))
        .await;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flakeup_events::{EventKind, channel};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(["sh", "-c", script])
    }

    fn collect_ready(rx: &mut mpsc::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_stdout_lines_and_outcome() {
        let (sink, mut rx) = channel();
        let config = UpdateConfig::default();
        let outcome = stream_command(sh("echo one; echo two"), "pkg", &config, &sink)
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "one\ntwo\n");

        let events = collect_ready(&mut rx);
        assert_eq!(events[0].kind, EventKind::CommandStart);
        let lines: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Line)
            .map(|e| e.message.clone().unwrap())
            .collect();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(events.last().unwrap().kind, EventKind::CommandEnd);
    }

    #[tokio::test]
    async fn captures_stderr_with_label() {
        let (sink, mut rx) = channel();
        let config = UpdateConfig::default();
        let outcome = stream_command(sh("echo oops >&2; exit 3"), "pkg", &config, &sink)
            .await
            .unwrap();

        assert_eq!(outcome.returncode, 3);
        assert_eq!(outcome.stderr, "oops\n");
        assert!(outcome.ensure_success().is_err());

        let events = collect_ready(&mut rx);
        let line = events.iter().find(|e| e.kind == EventKind::Line).unwrap();
        assert_eq!(line.stream, Some(StreamLabel::Stderr));
    }

    #[tokio::test]
    async fn allow_failure_suppresses_the_error() {
        let (sink, _rx) = channel();
        let config = UpdateConfig::default();
        let outcome = stream_command(
            sh("exit 1").allow_failure(),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap();
        assert!(outcome.ensure_success().is_ok());
    }

    #[tokio::test]
    async fn forces_a_dumb_terminal() {
        let (sink, _rx) = channel();
        let config = UpdateConfig::default();
        let outcome = stream_command(sh("printf %s \"$TERM\""), "pkg", &config, &sink)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "dumb");
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let (sink, _rx) = channel();
        let config = UpdateConfig::default();
        let outcome = stream_command(
            sh("printf %s \"$FAKE_HASHES\"").with_env("FAKE_HASHES", "1"),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "1");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (sink, _rx) = channel();
        let config = UpdateConfig::default();
        let err = stream_command(
            sh("sleep 30").with_timeout(Duration::from_millis(100)),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpdateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn suppression_drops_matching_lines() {
        let (sink, mut rx) = channel();
        let config = UpdateConfig::default();
        stream_command(
            sh("echo keep; echo 'specified: xyz'").suppress(["specified:"]),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap();

        let lines: Vec<_> = collect_ready(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Line)
            .map(|e| e.message.unwrap())
            .collect();
        assert_eq!(lines, vec!["keep"]);
    }

    #[tokio::test]
    async fn sanitizes_ansi_and_carriage_returns() {
        let (sink, mut rx) = channel();
        let config = UpdateConfig::default();
        stream_command(
            sh("printf '\\033[31mred\\033[0m\\r\\n'"),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap();

        let line = collect_ready(&mut rx)
            .into_iter()
            .find(|e| e.kind == EventKind::Line)
            .unwrap();
        assert_eq!(line.message.as_deref(), Some("red"));
    }

    #[test]
    fn sanitize_strips_ansi_sequences() {
        assert_eq!(sanitize_log_line("\u{1b}[1;32mok\u{1b}[0m\r"), "ok");
        assert_eq!(sanitize_log_line("plain"), "plain");
    }

    #[test]
    fn build_command_recognition() {
        let build = vec!["nix".to_string(), "build".to_string(), "-L".to_string()];
        assert!(is_build_command(&build));
        let abs = vec!["/run/current-system/sw/bin/nix".to_string(), "build".to_string()];
        assert!(is_build_command(&abs));
        let eval = vec!["nix".to_string(), "eval".to_string()];
        assert!(!is_build_command(&eval));
        assert!(!is_build_command(&[]));
    }

    #[test]
    fn render_command_quotes_and_truncates() {
        let args = vec!["nix".to_string(), "eval".to_string(), "--expr".to_string(),
            "a b".to_string()];
        assert_eq!(render_command(&args), "nix eval --expr 'a b'");

        let long = vec!["nix".to_string(), "x".repeat(200)];
        let rendered = render_command(&long);
        assert!(rendered.len() <= 80 + " [...]".len());
        assert!(rendered.ends_with(" [...]"));
    }

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let (sink, _rx) = channel();
        let config = UpdateConfig::default();
        let err = stream_command(
            CommandSpec::new(["flakeup-does-not-exist-xyz"]),
            "pkg",
            &config,
            &sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpdateError::Command { code: -1, .. }));
    }
}
