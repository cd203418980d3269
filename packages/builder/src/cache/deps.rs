//! The file-level dependency cache.
//!
//! Maps each source file to its direct include/import dependencies, as
//! reported by the language analyzers, and remembers a two-tier
//! fingerprint for every file it has seen. The incremental engine walks
//! the dependency map to decide which sources a changed file reaches, and
//! uses the fingerprints to decide what counts as changed in the first
//! place.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use color_eyre::Result;
use tracing::{debug, instrument, trace, warn};

use crate::{
    codec::{Reader, Writer},
    config::CacheConfig,
    hash::{self, Blake3},
    integrity::WorkspaceKey,
};

const MAGIC: &[u8; 8] = b"BLDDEPS\0";

#[derive(Debug, Default)]
struct Inner {
    direct: HashMap<PathBuf, BTreeSet<PathBuf>>,
    /// `(metadata, content)` fingerprint recorded the last time each file
    /// was checked; drives the metadata fast path in [`DepCache::check_changed`].
    fingerprints: HashMap<PathBuf, (Blake3, Blake3)>,
    dirty: bool,
}

/// Persistent map from source file to its direct dependencies.
#[derive(Debug)]
pub struct DepCache {
    path: PathBuf,
    key: WorkspaceKey,
    inner: Mutex<Inner>,
}

impl DepCache {
    /// Load from disk; absent, tampered, or expired files start empty.
    #[instrument(name = "DepCache::load", skip(key, config))]
    pub async fn load(path: impl Into<PathBuf> + std::fmt::Debug, key: WorkspaceKey, config: &CacheConfig) -> Self {
        let path = path.into();
        let max_age = Duration::from_secs(u64::from(config.max_age_days) * 24 * 60 * 60);

        let inner = match super::read_signed(&path, MAGIC, &key, max_age).await {
            Some(payload) => match decode(&payload) {
                Ok((direct, fingerprints)) => Inner {
                    direct,
                    fingerprints,
                    dirty: false,
                },
                Err(err) => {
                    warn!(?path, ?err, "undecodable dep cache, starting fresh");
                    Inner::default()
                }
            },
            None => Inner::default(),
        };

        debug!(?path, sources = inner.direct.len(), "loaded dep cache");
        Self {
            path,
            key,
            inner: Mutex::new(inner),
        }
    }

    /// Record the direct dependencies of a source.
    pub fn record(&self, source: impl Into<PathBuf>, deps: impl IntoIterator<Item = PathBuf>) {
        let mut inner = self.lock();
        inner.direct.insert(source.into(), deps.into_iter().collect());
        inner.dirty = true;
    }

    /// The direct dependencies of a source, if known.
    pub fn direct(&self, source: &Path) -> Option<BTreeSet<PathBuf>> {
        self.lock().direct.get(source).cloned()
    }

    /// The transitive dependency closure of a source, excluding the source
    /// itself. Cycle-safe: revisits are skipped.
    #[instrument(name = "DepCache::closure", skip(self))]
    pub fn closure(&self, source: &Path) -> BTreeSet<PathBuf> {
        let inner = self.lock();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<PathBuf> = inner
            .direct
            .get(source)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(dep) = queue.pop_front() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(transitive) = inner.direct.get(&dep) {
                queue.extend(transitive.iter().cloned());
            }
        }
        seen
    }

    /// The recorded fingerprint for a file, if it has been checked before.
    pub fn fingerprint(&self, path: &Path) -> Option<(Blake3, Blake3)> {
        self.lock().fingerprints.get(path).cloned()
    }

    /// Compare a file against its recorded fingerprint, updating the
    /// record to the current state. Returns whether the file changed since
    /// it was last seen; files never seen before are changed by definition.
    ///
    /// Untouched files resolve on the metadata fast path with a single
    /// `stat`; touched-but-identical files fall back to the content hash
    /// and report unchanged.
    #[instrument(name = "DepCache::check_changed", skip(self))]
    pub fn check_changed(&self, path: &Path) -> bool {
        let prior = self.lock().fingerprints.get(path).cloned();
        let Ok(two_tier) = hash::two_tier(path, prior.as_ref().map(|(metadata, _)| metadata))
        else {
            // Unreadable (deleted, permissions): let the rebuild surface it.
            return true;
        };

        let (changed, content) = match (two_tier.content, prior) {
            // Metadata fast path: the prior record still stands.
            (None, Some((_, content))) => (false, content),
            (Some(current), Some((_, content))) => (current != content, current),
            (Some(current), None) => (true, current),
            // `two_tier` only skips the content hash when a prior metadata
            // fingerprint matched.
            (None, None) => return true,
        };

        trace!(?path, changed, "change check");
        let mut inner = self.lock();
        inner.fingerprints.insert(path.to_path_buf(), (two_tier.metadata, content));
        inner.dirty = true;
        changed
    }

    /// Forget a source. Idempotent.
    pub fn forget(&self, source: &Path) {
        let mut inner = self.lock();
        let dropped = inner.direct.remove(source).is_some();
        let dropped = inner.fingerprints.remove(source).is_some() || dropped;
        if dropped {
            inner.dirty = true;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        if !inner.direct.is_empty() || !inner.fingerprints.is_empty() {
            inner.direct.clear();
            inner.fingerprints.clear();
            inner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().direct.is_empty()
    }

    /// Persist to disk. A no-op when nothing changed.
    #[instrument(name = "DepCache::flush", skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let payload = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            let payload = encode(&inner.direct, &inner.fingerprints);
            inner.dirty = false;
            payload
        };
        super::write_signed(&self.path, MAGIC, &self.key, &payload).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("dep cache lock poisoned")
    }
}

fn encode(
    direct: &HashMap<PathBuf, BTreeSet<PathBuf>>,
    fingerprints: &HashMap<PathBuf, (Blake3, Blake3)>,
) -> Vec<u8> {
    // Deterministic ordering so identical state encodes identically.
    let sorted: BTreeMap<&PathBuf, &BTreeSet<PathBuf>> = direct.iter().collect();
    let mut w = Writer::new();
    w.put_u32(sorted.len() as u32);
    for (source, deps) in sorted {
        w.put_str(&source.to_string_lossy());
        w.put_u32(deps.len() as u32);
        for dep in deps {
            w.put_str(&dep.to_string_lossy());
        }
    }

    let sorted: BTreeMap<&PathBuf, &(Blake3, Blake3)> = fingerprints.iter().collect();
    w.put_u32(sorted.len() as u32);
    for (path, (metadata, content)) in sorted {
        w.put_str(&path.to_string_lossy());
        w.put_str(metadata.as_str());
        w.put_str(content.as_str());
    }
    w.finish()
}

type Decoded = (
    HashMap<PathBuf, BTreeSet<PathBuf>>,
    HashMap<PathBuf, (Blake3, Blake3)>,
);

fn decode(payload: &[u8]) -> Result<Decoded> {
    let mut r = Reader::new(payload);
    let count = r.u32()? as usize;
    let mut direct = HashMap::with_capacity(count.min(4096));
    for _ in 0..count {
        let source = PathBuf::from(r.str()?);
        let mut deps = BTreeSet::new();
        for _ in 0..r.u32()? {
            deps.insert(PathBuf::from(r.str()?));
        }
        direct.insert(source, deps);
    }

    let count = r.u32()? as usize;
    let mut fingerprints = HashMap::with_capacity(count.min(4096));
    for _ in 0..count {
        let path = PathBuf::from(r.str()?);
        let metadata = Blake3::from_hex(r.str()?)?;
        let content = Blake3::from_hex(r.str()?)?;
        fingerprints.insert(path, (metadata, content));
    }
    Ok((direct, fingerprints))
}
