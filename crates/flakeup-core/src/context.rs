//! The explicit run context: configuration, repo layout, shared clients,
//! and the process-wide resources (build gate, cached lock file).

use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use flakeup_config::UpdateConfig;
use flakeup_flake_lock::{FlakeLock, FlakeLockNode};
use flakeup_forge::ForgeClient;
use flakeup_types::UpdateError;

use crate::paths::RepoPaths;
use crate::registry::UpdaterRegistry;

/// Return the current machine as a Nix platform string.
pub fn current_nix_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{os}", std::env::consts::ARCH)
}

/// Everything a task needs to run, passed explicitly. The three values
/// the original kept as process globals — the bounded build semaphore,
/// the updater registry, and the repo-root discovery result — live here.
pub struct RunContext {
    pub config: UpdateConfig,
    pub paths: RepoPaths,
    pub forge: ForgeClient,
    pub registry: UpdaterRegistry,
    build_gate: Arc<Semaphore>,
    flake_lock: RwLock<Option<FlakeLock>>,
    native_only: std::sync::atomic::AtomicBool,
}

impl RunContext {
    pub fn new(
        config: UpdateConfig,
        paths: RepoPaths,
        registry: UpdaterRegistry,
    ) -> Result<Self, UpdateError> {
        let forge = ForgeClient::new(&config)?;
        let build_gate = Arc::new(Semaphore::new(config.max_nix_builds.max(1)));
        Ok(Self {
            config,
            paths,
            forge,
            registry,
            build_gate,
            flake_lock: RwLock::new(None),
            native_only: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Restrict hash computation to the current platform (CI mode);
    /// other platforms' digests are preserved from disk at persist time.
    pub fn set_native_only(&self, native_only: bool) {
        self.native_only
            .store(native_only, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn native_only(&self) -> bool {
        self.native_only.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Gate an expensive build: evaluating many large configurations
    /// concurrently exhausts memory without this.
    pub async fn acquire_build_permit(&self) -> Result<OwnedSemaphorePermit, UpdateError> {
        self.build_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UpdateError::Cancelled)
    }

    /// Load and cache the repository's `flake.lock`.
    pub fn flake_lock(&self) -> Result<FlakeLock, UpdateError> {
        if let Some(lock) = self.flake_lock.read().unwrap().as_ref() {
            return Ok(lock.clone());
        }
        let lock = FlakeLock::from_file(&self.paths.flake_lock_file())?;
        *self.flake_lock.write().unwrap() = Some(lock.clone());
        Ok(lock)
    }

    /// Drop the cached lock file (after `flake lock --update-input`).
    pub fn invalidate_flake_lock(&self) {
        *self.flake_lock.write().unwrap() = None;
    }

    /// Look up a flake input's node: by internal node name first, then by
    /// resolving the root input indirection.
    pub fn input_node(&self, input_name: &str) -> Result<FlakeLockNode, UpdateError> {
        let lock = self.flake_lock()?;
        if let Some(node) = lock.nodes.get(input_name) {
            return Ok(node.clone());
        }
        if let Some(target) = lock.resolve_node_name(input_name)
            && let Some(node) = lock.nodes.get(target)
        {
            return Ok(node.clone());
        }
        Err(UpdateError::FlakeLock(format!(
            "flake input '{input_name}' not found in flake.lock"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_string_has_arch_and_os() {
        let platform = current_nix_platform();
        let (arch, os) = platform.split_once('-').unwrap();
        assert!(!arch.is_empty());
        assert!(["linux", "darwin"].contains(&os) || !os.is_empty());
    }

    #[tokio::test]
    async fn context_loads_and_caches_flake_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flake.lock"),
            r#"{"nodes": {"root": {"inputs": {}}}, "root": "root", "version": 7}"#,
        )
        .unwrap();

        let ctx = RunContext::new(
            UpdateConfig::default(),
            RepoPaths::at(dir.path()),
            UpdaterRegistry::default(),
        )
        .unwrap();

        assert!(ctx.flake_lock().is_ok());
        // A second read served from cache survives file removal.
        std::fs::remove_file(dir.path().join("flake.lock")).unwrap();
        assert!(ctx.flake_lock().is_ok());
        ctx.invalidate_flake_lock();
        assert!(ctx.flake_lock().is_err());
    }

    #[tokio::test]
    async fn build_permits_enforce_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig {
            max_nix_builds: 1,
            ..Default::default()
        };
        let ctx = RunContext::new(config, RepoPaths::at(dir.path()), UpdaterRegistry::default())
            .unwrap();

        let first = ctx.acquire_build_permit().await.unwrap();
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ctx.acquire_build_permit(),
        )
        .await;
        assert!(second.is_err(), "second permit should block");
        drop(first);
        assert!(ctx.acquire_build_permit().await.is_ok());
    }
}
