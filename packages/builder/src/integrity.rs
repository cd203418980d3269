//! Keyed integrity protection for persisted cache files.
//!
//! Every on-disk cache payload is wrapped in a [`SignedData`] envelope:
//! `{timestamp, nonce, payload, tag}` where the tag is a keyed Blake3 hash of
//! `timestamp ‖ nonce ‖ payload`. The key is derived from the workspace's
//! absolute path, so copying a cache between workspaces invalidates it.
//!
//! Verification failures and expiry are soft: callers treat the cache as
//! absent and start fresh, they never crash.

use std::{path::Path, time::Duration};

use color_eyre::Result;
use jiff::Timestamp;
use rand::RngCore;
use tracing::{instrument, trace};

use crate::{
    codec::{Reader, Writer},
    error::{BuildError, ErrorKind},
};

/// Envelopes older than this are treated as expired.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Key derivation context string. Changing this invalidates every cache.
const KEY_CONTEXT: &str = "builder-cache-v1";

/// A workspace-scoped signing key.
///
/// Derived from the workspace's absolute path via Blake3 key derivation, so
/// each workspace signs with a distinct key.
#[derive(Clone)]
pub struct WorkspaceKey([u8; 32]);

impl WorkspaceKey {
    /// Derive the key for the given workspace root.
    #[instrument(name = "WorkspaceKey::derive")]
    pub fn derive(workspace: &Path) -> Self {
        let material = workspace.as_os_str().as_encoded_bytes();
        Self(blake3::derive_key(KEY_CONTEXT, material))
    }

    /// A fixed key for tests that do not care about workspace scoping.
    pub fn for_tests() -> Self {
        Self([0x42; 32])
    }

    fn tag(&self, timestamp: i64, nonce: &[u8], payload: &[u8]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(nonce);
        hasher.update(payload);
        hasher.finalize()
    }
}

impl std::fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("WorkspaceKey(..)")
    }
}

/// Wrap `payload` in a signed envelope.
#[instrument(skip_all, fields(bytes = payload.len()))]
pub fn seal(key: &WorkspaceKey, payload: &[u8]) -> Vec<u8> {
    let timestamp = Timestamp::now().as_second();
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let tag = key.tag(timestamp, &nonce, payload);

    let mut w = Writer::new();
    w.put_i64(timestamp)
        .put_raw(&nonce)
        .put_bytes(payload)
        .put_raw(tag.as_bytes());
    w.finish()
}

/// Verify and unwrap a signed envelope.
///
/// Fails with [`ErrorKind::CacheCorrupted`] on tag mismatch or malformed
/// framing, and with [`ErrorKind::CacheLoadFailed`] on expiry. Both are soft
/// failures by policy: the caller logs and proceeds with an empty cache.
#[instrument(skip_all, fields(bytes = sealed.len()))]
pub fn open(key: &WorkspaceKey, sealed: &[u8], max_age: Duration) -> Result<Vec<u8>> {
    let mut r = Reader::new(sealed);
    let parsed: Result<_> = (|| {
        let timestamp = r.i64()?;
        let nonce = r.raw(NONCE_LEN)?.to_vec();
        let payload = r.bytes()?.to_vec();
        let tag: [u8; TAG_LEN] = r.raw(TAG_LEN)?.try_into().unwrap();
        Ok((timestamp, nonce, payload, tag))
    })();

    let Ok((timestamp, nonce, payload, tag)) = parsed else {
        return Err(BuildError::new(ErrorKind::CacheCorrupted, "malformed signed envelope").into());
    };

    // blake3::Hash compares in constant time.
    let expected = key.tag(timestamp, &nonce, &payload);
    if expected != blake3::Hash::from_bytes(tag) {
        return Err(BuildError::new(
            ErrorKind::CacheCorrupted,
            "signature mismatch: cache was tampered with or copied between workspaces",
        )
        .suggest("delete the .builder-cache directory to start fresh")
        .into());
    }

    let age = Timestamp::now().as_second().saturating_sub(timestamp);
    if age > max_age.as_secs() as i64 {
        return Err(BuildError::new(
            ErrorKind::CacheLoadFailed,
            format!("cache expired: written {age}s ago, max age {}s", max_age.as_secs()),
        )
        .into());
    }

    trace!(bytes = payload.len(), age, "opened signed envelope");
    Ok(payload)
}
