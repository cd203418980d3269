//! Persistent caches.
//!
//! Four caches share one on-disk discipline: an 8-byte magic, a 1-byte
//! format version, then a signed envelope (see [`crate::integrity`]) whose
//! payload is a typed binary record stream (see [`crate::codec`]).
//!
//! - [`BuildCache`]: target fingerprint -> recorded output hash.
//! - [`ActionCache`]: action fingerprint -> recorded outputs and metadata.
//! - [`DepCache`]: source file -> direct include/import dependencies.
//! - [`GraphCache`]: the dependency graph itself, keyed by Builderfile hash.
//!
//! Load failures are soft everywhere: a tampered, expired, or torn cache
//! file logs a warning and behaves as an empty cache.

mod action;
mod build;
mod deps;
mod graph;

pub use action::{ActionCache, ActionCacheStats, ActionId, ActionKind, ActionOutput, ActionRecord};
pub use build::{BuildCache, BuildCacheStats, CacheEntry};
pub use deps::DepCache;
pub use graph::GraphCache;

use std::{path::Path, time::Duration};

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, warn};

use crate::{
    error::{BuildError, ErrorKind},
    fs,
    integrity::{self, WorkspaceKey},
};

/// Shared format version for all cache files.
const FORMAT_VERSION: u8 = 1;

/// Write a signed cache file: magic, version, envelope.
#[instrument(skip(key, payload), fields(bytes = payload.len()))]
pub(crate) async fn write_signed(
    path: &Path,
    magic: &[u8; 8],
    key: &WorkspaceKey,
    payload: &[u8],
) -> Result<()> {
    let mut file = Vec::with_capacity(payload.len() + 64);
    file.extend_from_slice(magic);
    file.push(FORMAT_VERSION);
    file.extend_from_slice(&integrity::seal(key, payload));
    fs::write_atomic(path, &file)
        .await
        .with_context(|| format!("persist cache file {path:?}"))
}

/// Read and verify a signed cache file.
///
/// Returns `None` (after logging) when the file is absent, has the wrong
/// magic or version, fails signature verification, or is expired. Cache
/// corruption is never a hard error.
#[instrument(skip(key))]
pub(crate) async fn read_signed(
    path: &Path,
    magic: &[u8; 8],
    key: &WorkspaceKey,
    max_age: Duration,
) -> Option<Vec<u8>> {
    let bytes = match fs::read_opt(path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(err) => {
            warn!(?path, ?err, "unreadable cache file, starting fresh");
            return None;
        }
    };

    if bytes.len() < 9 || &bytes[..8] != magic {
        warn!(?path, "cache file has wrong magic, starting fresh");
        return None;
    }
    if bytes[8] != FORMAT_VERSION {
        warn!(?path, version = bytes[8], "unsupported cache version, starting fresh");
        return None;
    }

    match integrity::open(key, &bytes[9..], max_age) {
        Ok(payload) => Some(payload),
        Err(err) => {
            let kind = BuildError::from_report(&err)
                .map(BuildError::kind)
                .unwrap_or(ErrorKind::CacheCorrupted);
            warn!(?path, %kind, "cache rejected, starting fresh");
            None
        }
    }
}
