//! Canonical JSON rendering and the atomic file writer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Render a value as canonical manifest JSON: two-space indent, sorted
/// keys (guaranteed by field declaration order and `BTreeMap` use), and a
/// single trailing newline.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut payload =
        serde_json::to_vec_pretty(value).context("failed to serialize manifest JSON")?;
    payload.push(b'\n');
    Ok(payload)
}

/// Atomically replace `path` with `bytes`.
///
/// Writes to a temp file in the destination directory, fsyncs it, copies
/// the existing file's mode when present, then renames over the
/// destination. The temp file is unlinked on any failure.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("manifest");
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;

    tmp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())
            .with_context(|| format!("failed to copy mode onto temp file for {}", path.display()))?;
    }

    tmp.persist(path)
        .with_context(|| format!("failed to rename temp file over {}", path.display()))?;
    Ok(())
}
