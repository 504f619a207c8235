//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / directory-listing code.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// List the regular files directly inside `dir` whose file name satisfies `filter`.
///
/// The returned order is whatever the filesystem yields.
pub async fn list_files_matching<F>(dir: &Path, mut filter: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&str) -> bool,
{
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error("reading directory", dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(name) = name.to_str()
            && filter(name)
        {
            files.push(entry.path());
        }
    }

    Ok(files)
}

/// List the names of the directories directly inside `dir`.
pub async fn list_subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error("reading directory", dir, e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir()
            && let Some(name) = entry.file_name().to_str().map(str::to_string)
        {
            names.push(name);
        }
    }

    Ok(names)
}
