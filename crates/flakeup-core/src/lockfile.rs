//! Advisory file locks for per-package manifest writes.
//!
//! The platform-sharded hash flow writes temporary entries to the real
//! `sources.json` (the build tool reads it at eval time), so the whole
//! per-package dance runs under an advisory lock at `sources.json.lock`.
//! Different packages proceed independently.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flakeup_types::UpdateError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

/// Held advisory lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl FileLockGuard {
    /// Lock-file path guarding `target` (`<target>.lock`).
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        name.push_str(".lock");
        target.with_file_name(name)
    }

    /// Acquire the lock for `target`, polling until the holder releases
    /// it or the default timeout expires.
    pub async fn acquire(target: &Path) -> Result<Self, UpdateError> {
        Self::acquire_with_timeout(target, DEFAULT_ACQUIRE_TIMEOUT).await
    }

    pub async fn acquire_with_timeout(
        target: &Path,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let path = Self::lock_path_for(target);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(UpdateError::Timeout {
                            command: format!("acquire lock {}", path.display()),
                            seconds: timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => {
                    return Err(UpdateError::message(format!(
                        "failed to create lock file {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
