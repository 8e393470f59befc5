//! Filesystem helpers shared across modules.
//!
//! These helpers attach operation + path context to IO errors and make the
//! delete/move primitives used by the segment store safe to retry.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

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

/// Size of a regular file in bytes.
pub async fn file_len(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error("reading metadata of", path, e))?;
    if !meta.is_file() {
        return Err(Error::validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(meta.len())
}

/// Flush a closed file's data to stable storage.
pub async fn sync_file(path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| io_error("syncing", path, e))
}

/// Last modification time of a file.
pub async fn modified_at(path: &Path) -> Result<chrono::DateTime<chrono::Utc>> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error("reading metadata of", path, e))?;
    let modified = meta
        .modified()
        .map_err(|e| io_error("reading mtime of", path, e))?;
    Ok(modified.into())
}

/// Whether a path exists. Errors other than "not found" are reported.
pub async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| io_error("checking", path, e))
}

/// Delete a file. A file that is already gone counts as deleted.
///
/// Returns `true` if a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("deleting", path, e)),
    }
}

/// Move a file, falling back to copy + delete across filesystems.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    ensure_parent_dir(to).await?;
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| io_error("copying", from, e))?;
            remove_file_if_exists(from).await.map(|_| ())
        }
        Err(e) => Err(io_error("moving", from, e)),
    }
}

/// Move everything inside `from` into `to`, merging into directories that
/// already exist. Files whose destination exists stay where they are, and
/// `from` is removed only once it is empty.
///
/// Returns the number of files moved and the number left behind.
pub fn merge_dir_sync(from: &Path, to: &Path) -> Result<(usize, usize)> {
    ensure_dir_all_sync_with_op("creating directory", to)?;
    let entries = std::fs::read_dir(from).map_err(|e| io_error("listing", from, e))?;

    let (mut moved, mut skipped) = (0, 0);
    for entry in entries {
        let entry = entry.map_err(|e| io_error("listing", from, e))?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| io_error("reading metadata of", &source, e))?;

        if file_type.is_dir() {
            let (m, s) = merge_dir_sync(&source, &target)?;
            moved += m;
            skipped += s;
        } else if target.symlink_metadata().is_ok() {
            skipped += 1;
        } else {
            move_file_sync(&source, &target)?;
            moved += 1;
        }
    }

    if skipped == 0 {
        std::fs::remove_dir(from).map_err(|e| io_error("removing directory", from, e))?;
    }
    Ok((moved, skipped))
}

fn move_file_sync(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            std::fs::copy(from, to).map_err(|e| io_error("copying", from, e))?;
            std::fs::remove_file(from).map_err(|e| io_error("deleting", from, e))
        }
        Err(e) => Err(io_error("moving", from, e)),
    }
}

/// Delete a directory tree. A directory that is already gone counts as deleted.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("deleting directory", path, e)),
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Regular files directly inside `dir`. A missing directory yields nothing.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| io_error("reading metadata of", &entry.path(), e))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Sub-directories directly inside `dir`. A missing directory yields nothing.
pub async fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| io_error("reading metadata of", &entry.path(), e))?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Create `dir` and check that a file can be written into it.
pub fn probe_writable(dir: &Path) -> Result<()> {
    ensure_dir_all_sync_with_op("creating volume root", dir)?;
    let probe = tempfile::Builder::new()
        .prefix(".camrec-probe")
        .tempfile_in(dir)
        .map_err(|e| io_error("probing write access to", dir, e))?;
    probe
        .close()
        .map_err(|e| io_error("removing write probe in", dir, e))
}
