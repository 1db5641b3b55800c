use anyhow::{Context, Result};
use std::path::Path;

/// Write `data` to `path` atomically: the bytes land in a sibling `.tmp`
/// file first and are renamed over the destination, so readers observe
/// either the previous contents or the new contents, never a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;

    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error).with_context(|| format!("rename into {}", path.display()));
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("marshal json")?;
    write_atomic(path, &data)
}
