//! Content-addressed blob storage.
//!
//! The CAS is intentionally "stupid": it stores and retrieves bytes keyed by
//! their Blake3 hash and knows nothing about targets, actions, or languages.
//!
//! ## Layout
//!
//! Blobs live at `<root>/<shard>/<hash>` where `shard` is the first two hex
//! characters of the hash (256-way sharding keeps directory listings sane).
//! There are no metadata files: refcounts live in memory and are
//! reconstructed by scanning the storage directory on open.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use tap::TapFallible;
use tracing::{instrument, trace, warn};
use walkdir::WalkDir;

use crate::{
    error::{BuildError, ErrorKind},
    fs,
    hash::Blake3,
};

/// Storage statistics. The deduplication ratio is `unique / total`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CasStats {
    /// Logical blobs stored (sum of refcounts).
    pub total_blobs: u64,
    /// Unique blobs on disk.
    pub unique_blobs: u64,
    /// Bytes on disk across unique blobs.
    pub total_bytes: u64,
    /// `unique_blobs / total_blobs`; 1.0 when empty.
    pub dedup_ratio: f64,
}

/// Filesystem-backed content-addressed store with in-memory refcounts.
#[derive(Debug)]
pub struct FsCas {
    root: PathBuf,
    refcounts: DashMap<Blake3, u64>,
    total_bytes: AtomicU64,
}

impl FsCas {
    /// Open the store rooted at `root`, creating the directory if missing and
    /// rebuilding refcounts from the blobs already on disk.
    ///
    /// Every pre-existing blob starts with refcount 1: the scan cannot know
    /// how many logical references existed before, only that the blob is live.
    #[instrument(name = "FsCas::open")]
    pub async fn open(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let scan_root = root.clone();
        let (refcounts, total_bytes) =
            tokio::task::spawn_blocking(move || scan_blobs(&scan_root))
                .await
                .context("join blob scan")??;

        trace!(?root, blobs = refcounts.len(), total_bytes, "opened cas");
        Ok(Self {
            root,
            refcounts,
            total_bytes: AtomicU64::new(total_bytes),
        })
    }

    fn blob_path(&self, key: &Blake3) -> PathBuf {
        self.root.join(key.shard()).join(key.as_str())
    }

    /// Store a blob, returning its hash.
    ///
    /// If the content is already present the refcount is incremented and no
    /// bytes are written. Concurrent puts of identical content are safe: the
    /// refcount ends up equal to the number of puts and exactly one file
    /// exists (identical bytes, last-writer-wins).
    #[instrument(name = "FsCas::put_blob", skip_all, fields(bytes = content.len()))]
    pub async fn put_blob(&self, content: &[u8]) -> Result<Blake3> {
        let key = Blake3::from_buffer(content);

        let newly_referenced = {
            let mut count = self.refcounts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if newly_referenced {
            let dst = self.blob_path(&key);
            fs::write_atomic(&dst, content).await?;
            self.total_bytes.fetch_add(content.len() as u64, Ordering::Relaxed);
            trace!(%key, "stored blob");
        } else {
            trace!(%key, "deduplicated blob");
        }

        Ok(key)
    }

    /// Fetch a blob's bytes, or `None` if absent.
    #[instrument(name = "FsCas::get_blob")]
    pub async fn get_blob(&self, key: &Blake3) -> Result<Option<Vec<u8>>> {
        fs::read_opt(&self.blob_path(key))
            .await
            .tap_ok(|blob| trace!(%key, found = blob.is_some(), "blob lookup"))
    }

    /// Fetch a blob's bytes, erroring if absent.
    #[instrument(name = "FsCas::must_get_blob")]
    pub async fn must_get_blob(&self, key: &Blake3) -> Result<Vec<u8>> {
        self.get_blob(key).await?.ok_or_else(|| {
            BuildError::new(ErrorKind::IoNotFound, format!("blob {key} not in store")).into()
        })
    }

    /// Whether a blob is present.
    pub fn has_blob(&self, key: &Blake3) -> bool {
        self.refcounts.get(key).is_some_and(|count| *count > 0)
    }

    /// Increment a blob's refcount.
    #[instrument(name = "FsCas::add_ref")]
    pub fn add_ref(&self, key: &Blake3) {
        *self.refcounts.entry(key.clone()).or_insert(0) += 1;
    }

    /// Decrement a blob's refcount. Returns whether the blob is now
    /// unreferenced and may be deleted. Never underflows.
    #[instrument(name = "FsCas::remove_ref")]
    pub fn remove_ref(&self, key: &Blake3) -> bool {
        match self.refcounts.get_mut(key) {
            Some(mut count) => {
                if *count > 0 {
                    *count -= 1;
                }
                *count == 0
            }
            None => {
                warn!(%key, "remove_ref on unknown blob");
                false
            }
        }
    }

    /// Delete an unreferenced blob from disk.
    ///
    /// Refuses with [`ErrorKind::CacheInUse`] while the refcount is positive.
    #[instrument(name = "FsCas::delete_blob")]
    pub async fn delete_blob(&self, key: &Blake3) -> Result<()> {
        if let Some(count) = self.refcounts.get(key)
            && *count > 0
        {
            return Err(BuildError::new(
                ErrorKind::CacheInUse,
                format!("blob {key} still has {} references", *count),
            )
            .into());
        }

        let path = self.blob_path(key);
        if let Some(size) = fs::size_opt(&path).await? {
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
        }
        fs::remove_file_idempotent(&path).await?;
        self.refcounts.remove(key);
        trace!(%key, "deleted blob");
        Ok(())
    }

    /// Current storage statistics.
    pub fn stats(&self) -> CasStats {
        let unique_blobs = self.refcounts.len() as u64;
        let total_blobs: u64 = self.refcounts.iter().map(|entry| *entry.value()).sum();
        CasStats {
            total_blobs,
            unique_blobs,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            dedup_ratio: if total_blobs == 0 {
                1.0
            } else {
                unique_blobs as f64 / total_blobs as f64
            },
        }
    }
}

fn scan_blobs(root: &Path) -> Result<(DashMap<Blake3, u64>, u64)> {
    let refcounts = DashMap::new();
    let mut total_bytes = 0;

    for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
        let entry = entry.context("scan cas directory")?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        match Blake3::from_hex(name.as_ref()) {
            Ok(key) => {
                total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                refcounts.insert(key, 1);
            }
            Err(_) => {
                // Leftover temp files from interrupted writes are expected.
                trace!(path = ?entry.path(), "skipping non-blob file in cas");
            }
        }
    }

    Ok((refcounts, total_bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open(dir.path()).await.unwrap();

        let key = cas.put_blob(b"hello world").await.unwrap();
        assert!(cas.has_blob(&key));
        assert_eq!(cas.get_blob(&key).await.unwrap().unwrap(), b"hello world");

        // put(get(h)) = h
        let bytes = cas.must_get_blob(&key).await.unwrap();
        assert_eq!(cas.put_blob(&bytes).await.unwrap(), key);
    }

    #[tokio::test]
    async fn concurrent_identical_puts_count_references() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(FsCas::open(dir.path()).await.unwrap());

        let puts = 16;
        let mut tasks = Vec::new();
        for _ in 0..puts {
            let cas = Arc::clone(&cas);
            tasks.push(tokio::spawn(async move {
                cas.put_blob(b"identical content").await.unwrap()
            }));
        }
        let mut keys = Vec::new();
        for task in tasks {
            keys.push(task.await.unwrap());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);

        let stats = cas.stats();
        assert_eq!(stats.total_blobs, puts);
        assert_eq!(stats.unique_blobs, 1);
        assert!((stats.dedup_ratio - 1.0 / puts as f64).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn delete_respects_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open(dir.path()).await.unwrap();

        let key = cas.put_blob(b"blob").await.unwrap();
        cas.add_ref(&key);

        // Two references: neither decrement alone permits deletion.
        assert!(!cas.remove_ref(&key));
        assert!(cas.delete_blob(&key).await.is_err());

        assert!(cas.remove_ref(&key));
        cas.delete_blob(&key).await.unwrap();
        assert!(!cas.has_blob(&key));
        assert_eq!(cas.get_blob(&key).await.unwrap(), None);

        // remove_ref never underflows.
        assert!(!cas.remove_ref(&key));
    }

    #[tokio::test]
    async fn refcounts_rebuild_from_disk_scan() {
        let dir = tempfile::tempdir().unwrap();
        let key = {
            let cas = FsCas::open(dir.path()).await.unwrap();
            cas.put_blob(b"persisted").await.unwrap()
        };

        let reopened = FsCas::open(dir.path()).await.unwrap();
        assert!(reopened.has_blob(&key));
        let stats = reopened.stats();
        assert_eq!(stats.unique_blobs, 1);
        assert_eq!(stats.total_bytes, b"persisted".len() as u64);
    }

    #[tokio::test]
    async fn blobs_are_sharded_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open(dir.path()).await.unwrap();
        let key = cas.put_blob(b"sharded").await.unwrap();

        let expected = dir.path().join(key.shard()).join(key.as_str());
        assert!(expected.exists());
    }
}
