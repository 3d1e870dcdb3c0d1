//! Repository root discovery and per-package file maps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use flakeup_types::UpdateError;

/// Directories containing per-package `sources.json` and `updater.toml`.
pub const PACKAGE_DIRS: [&str; 2] = ["packages", "overlays"];

/// Resolved repository layout. Passed explicitly instead of living in a
/// process-wide global.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    root: PathBuf,
}

impl RepoPaths {
    /// Use an explicit repository root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Discover the repository root: `REPO_ROOT` when set, else the first
    /// ancestor of the working directory containing `flake.nix`, else the
    /// working directory itself.
    pub fn discover() -> Self {
        if let Ok(root) = std::env::var("REPO_ROOT")
            && !root.trim().is_empty()
        {
            return Self::at(root);
        }
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        for candidate in cwd.ancestors() {
            if candidate.join("flake.nix").exists() {
                return Self::at(candidate);
            }
        }
        Self::at(cwd)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn flake_lock_file(&self) -> PathBuf {
        self.repo_file("flake.lock")
    }

    /// `{name: path}` for every package subdirectory containing
    /// `filename`. A package name appearing under more than one package
    /// directory is a hard error.
    pub fn package_file_map(&self, filename: &str) -> Result<BTreeMap<String, PathBuf>, UpdateError> {
        let mut result: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut duplicates: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

        for dir in PACKAGE_DIRS {
            let pkg_root = self.root.join(dir);
            let Ok(children) = std::fs::read_dir(&pkg_root) else {
                continue;
            };
            let mut entries: Vec<PathBuf> = children
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect();
            entries.sort();
            for child in entries {
                if !child.is_dir() {
                    continue;
                }
                let candidate = child.join(filename);
                if !candidate.exists() {
                    continue;
                }
                let name = child
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(existing) = result.get(&name) {
                    duplicates
                        .entry(name)
                        .or_insert_with(|| vec![existing.clone()])
                        .push(candidate);
                    continue;
                }
                result.insert(name, candidate);
            }
        }

        if !duplicates.is_empty() {
            let mut lines = vec![format!("duplicate per-package {filename} entries detected:")];
            for (name, paths) in &duplicates {
                let rendered: Vec<String> = paths
                    .iter()
                    .map(|p| {
                        p.strip_prefix(&self.root)
                            .unwrap_or(p)
                            .display()
                            .to_string()
                    })
                    .collect();
                lines.push(format!("- {name}: {}", rendered.join(", ")));
            }
            return Err(UpdateError::Validation(lines.join("\n")));
        }

        Ok(result)
    }

    /// The unique package directory for `name`, or `None`.
    pub fn package_dir_for(&self, name: &str) -> Result<Option<PathBuf>, UpdateError> {
        let matches: Vec<PathBuf> = PACKAGE_DIRS
            .iter()
            .map(|dir| self.root.join(dir).join(name))
            .filter(|candidate| candidate.is_dir())
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            many => {
                let rendered: Vec<String> = many
                    .iter()
                    .map(|p| {
                        p.strip_prefix(&self.root)
                            .unwrap_or(p)
                            .display()
                            .to_string()
                    })
                    .collect();
                Err(UpdateError::Validation(format!(
                    "duplicate package directories for '{name}': {}",
                    rendered.join(", ")
                )))
            }
        }
    }

    /// The `sources.json` path for a named package, or `None`.
    pub fn sources_file_for(&self, name: &str) -> Result<Option<PathBuf>, UpdateError> {
        Ok(self.package_file_map("sources.json")?.remove(name))
    }
}
