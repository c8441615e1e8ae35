use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create dir {}", path.display()))?;
    Ok(())
}

pub fn iso_timestamp() -> String {
    let now = Local::now();
    now.format("%Y-%m-%dT%H-%M-%S%.3f%z").to_string()
}

/// Ledger identity of a source file: its basename, directory ignored.
pub fn task_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Case-insensitive extension check; allow-list entries may carry a leading dot.
pub fn extension_allowed(path: &Path, allowed: &[String]) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return false;
    };
    allowed
        .iter()
        .any(|entry| entry.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Resolves `path` against the current directory; the input comes back
/// unchanged if that fails.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `<output_dir>/<stem>.<extension>` for a task name such as `movie.mp4`.
pub fn artifact_path_for(output_dir: &Path, name: &str, extension: &str) -> PathBuf {
    let stem = Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = extension.trim_start_matches('.');
    output_dir.join(format!("{stem}.{extension}"))
}

/// Picks a free path for `file_name` inside `dir`, appending a timestamp
/// suffix (and then a counter) when the plain name is taken.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let plain = dir.join(file_name);
    if !plain.exists() {
        return plain;
    }
    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = original
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = iso_timestamp();
    let stamped = dir.join(format!("{stem}_{stamp}{ext}"));
    if !stamped.exists() {
        return stamped;
    }
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{stamp}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Rename, falling back to copy + remove when the rename crosses devices.
pub fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !from.exists() {
                return Err(rename_err);
            }
            tracing::debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "rename failed, copying instead"
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
