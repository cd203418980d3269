//! Hashing operations and types.
//!
//! File fingerprints come in two tiers: a cheap metadata fingerprint over
//! `(size, mtime_ns, inode)` and a Blake3 content fingerprint. Content
//! hashing is size-tiered so that large artifacts do not dominate cache
//! validation time:
//!
//! - Tiny (< 4 KiB): full-content hash.
//! - Medium (<= 100 MiB): 16 evenly spaced 4 KiB windows, plus the total size.
//! - Large (> 100 MiB): 8 evenly spaced 1 KiB windows, plus the first and
//!   last 4 KiB blocks, plus the total size.
//!
//! Window offsets are a pure function of the file length, so the same scheme
//! always produces the same hash for the same content. The total size is
//! always mixed in, so same-size files only collide if every sampled window
//! agrees.
//!
//! A zero-byte file hashes to the Blake3 hash of empty input:
//! `af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262`.

use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

/// File size below which content is hashed in full.
const TINY_MAX: u64 = 4 * 1024;
/// File size above which the aggressive sampling tier kicks in.
const MEDIUM_MAX: u64 = 100 * 1024 * 1024;

const MEDIUM_WINDOWS: u64 = 16;
const MEDIUM_WINDOW_LEN: u64 = 4 * 1024;
const LARGE_WINDOWS: u64 = 8;
const LARGE_WINDOW_LEN: u64 = 1024;
const LARGE_EDGE_LEN: u64 = 4 * 1024;

/// A Blake3 hash, hex-encoded.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Blake3(String);

impl Blake3 {
    /// Hash the contents of a buffer.
    #[instrument(skip_all, name = "Blake3::from_buffer")]
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let hash = hex::encode(blake3::hash(buffer).as_bytes());
        trace!(%hash, bytes = buffer.len(), "hash buffer");
        Self(hash)
    }

    /// Hash the full contents of the file at the specified path.
    #[instrument(name = "Blake3::from_file")]
    pub fn from_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| format!("open {path:?}"))?;

        let mut reader = std::io::BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let bytes = std::io::copy(&mut reader, &mut hasher)
            .with_context(|| format!("hash {path:?}"))?;

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?path, %hash, bytes, "hash file");
        Ok(Self(hash))
    }

    /// Hash the contents of the iterator in order.
    #[instrument(skip_all, name = "Blake3::from_fields")]
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Parse a hex-encoded hash, validating shape.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let hex = hex.as_ref();
        color_eyre::eyre::ensure!(
            hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()),
            "malformed blake3 hex: {hex:?}",
        );
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shard prefix: first two hex characters.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl AsRef<str> for Blake3 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Blake3 {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&Blake3> for Blake3 {
    fn from(hash: &Blake3) -> Self {
        hash.clone()
    }
}

/// The result of a two-tier fingerprint check.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TwoTierHash {
    /// The metadata fingerprint, always computed.
    pub metadata: Blake3,
    /// The content fingerprint, computed only when metadata changed
    /// relative to the prior fingerprint (or no prior was supplied).
    pub content: Option<Blake3>,
}

impl TwoTierHash {
    /// Whether the content hash was computed on this check.
    pub fn content_hashed(&self) -> bool {
        self.content.is_some()
    }
}

/// Fingerprint of a file's metadata: `(size, mtime_ns, inode)`.
///
/// Constant-time with respect to file size; used as the fast path for cache
/// validation. Two files with identical metadata fingerprints are assumed
/// unchanged without reading their contents.
#[instrument(name = "hash::metadata_fingerprint")]
pub fn metadata_fingerprint(path: &Path) -> Result<Blake3> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {path:?}"))?;

    let size = meta.len();
    let (mtime_ns, file_id) = metadata_identity(&meta);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&size.to_be_bytes());
    hasher.update(&mtime_ns.to_be_bytes());
    hasher.update(&file_id.to_be_bytes());
    Ok(Blake3(hex::encode(hasher.finalize().as_bytes())))
}

#[cfg(unix)]
fn metadata_identity(meta: &std::fs::Metadata) -> (i128, u64) {
    use std::os::unix::fs::MetadataExt;
    let mtime_ns = (meta.mtime() as i128) * 1_000_000_000 + meta.mtime_nsec() as i128;
    (mtime_ns, meta.ino())
}

#[cfg(not(unix))]
fn metadata_identity(meta: &std::fs::Metadata) -> (i128, u64) {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or_default();
    (mtime_ns, 0)
}

/// Size-tiered content fingerprint of the file at `path`.
#[instrument(name = "hash::content_fingerprint")]
pub fn content_fingerprint(path: &Path) -> Result<Blake3> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {path:?}"))?;
    let len = meta.len();

    if len < TINY_MAX {
        return Blake3::from_file(path);
    }

    let mut file = std::fs::File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&len.to_be_bytes());

    if len <= MEDIUM_MAX {
        sample_windows(&mut file, &mut hasher, len, MEDIUM_WINDOWS, MEDIUM_WINDOW_LEN)
            .with_context(|| format!("sample {path:?}"))?;
    } else {
        // First and last blocks pin the edges, windows cover the middle.
        read_window(&mut file, &mut hasher, 0, LARGE_EDGE_LEN)?;
        read_window(&mut file, &mut hasher, len - LARGE_EDGE_LEN, LARGE_EDGE_LEN)?;
        sample_windows(&mut file, &mut hasher, len, LARGE_WINDOWS, LARGE_WINDOW_LEN)
            .with_context(|| format!("sample {path:?}"))?;
    }

    let hash = hex::encode(hasher.finalize().as_bytes());
    trace!(?path, %hash, len, "sampled content fingerprint");
    Ok(Blake3(hash))
}

/// Two-tier fingerprint: recompute metadata; skip content when unchanged.
///
/// This is the cache-validation fast path. Files untouched since the prior
/// build resolve with a single `stat`.
#[instrument(name = "hash::two_tier")]
pub fn two_tier(path: &Path, prior_metadata: Option<&Blake3>) -> Result<TwoTierHash> {
    let metadata = metadata_fingerprint(path)?;
    if prior_metadata == Some(&metadata) {
        return Ok(TwoTierHash {
            metadata,
            content: None,
        });
    }

    let content = content_fingerprint(path)?;
    Ok(TwoTierHash {
        metadata,
        content: Some(content),
    })
}

fn sample_windows(
    file: &mut std::fs::File,
    hasher: &mut blake3::Hasher,
    len: u64,
    windows: u64,
    window_len: u64,
) -> Result<()> {
    // Offsets evenly spaced over [0, len - window_len].
    let span = len.saturating_sub(window_len);
    for i in 0..windows {
        let offset = span * i / (windows - 1).max(1);
        read_window(file, hasher, offset, window_len)?;
    }
    Ok(())
}

fn read_window(
    file: &mut std::fs::File,
    hasher: &mut blake3::Hasher,
    offset: u64,
    window_len: u64,
) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).context("seek window")?;
    let mut buf = vec![0u8; window_len as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).context("read window")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    hasher.update(&buf[..filled]);
    Ok(())
}
