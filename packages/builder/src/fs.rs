//! Filesystem operations tailored to `builder`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using. Everything
//! else in the crate goes through these helpers so that error context is
//! attached uniformly.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Read the full contents of a file, or `None` if it does not exist.
#[instrument]
pub async fn read_opt(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read {path:?}")),
    }
}

/// Read the full contents of a file, erroring if it does not exist.
#[instrument]
pub async fn must_read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read {path:?}"))
}

/// Write a file atomically via a temp-file-then-rename in the same directory.
///
/// The parent directory is created if missing.
#[instrument(skip(content))]
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent directory {parent:?}"))?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, content)
        .await
        .with_context(|| format!("write {temp:?}"))?;

    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!(?temp, ?err, "failed to remove temp file");
            }
            Err(err).context(format!("rename {temp:?} to {path:?}"))
        }
    }
}

/// Create a directory and all of its parents.
#[instrument]
pub async fn create_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("create directory {path:?}"))
}

/// Remove a file, treating "not found" as success.
#[instrument]
pub async fn remove_file_idempotent(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove {path:?}")),
    }
}

/// Remove a directory tree, treating "not found" as success.
#[instrument]
pub async fn remove_dir_all_idempotent(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory {path:?}")),
    }
}

/// Whether a path exists.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// File size in bytes, or `None` if the file does not exist.
#[instrument]
pub async fn size_opt(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat {path:?}")),
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}
