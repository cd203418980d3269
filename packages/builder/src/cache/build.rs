//! The target-level build cache.
//!
//! Answers "is target T up-to-date given sources S and deps D?" and records
//! the answer when a target finishes. Source validation uses the two-tier
//! fingerprint: the metadata hash resolves unchanged files without reading
//! them, and the content hash catches touched-but-identical files.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use rayon::prelude::*;
use tracing::{debug, instrument, trace, warn};

use crate::{
    codec::{Reader, Writer},
    config::CacheConfig,
    graph::{decode_target_id, encode_target_id},
    hash::{self, Blake3},
    integrity::WorkspaceKey,
    target::TargetId,
};

const MAGIC: &[u8; 8] = b"BLDCACHE";

/// Above this many sources, per-source hashing fans out across rayon.
const PARALLEL_HASH_THRESHOLD: usize = 8;

/// One recorded target state.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CacheEntry {
    /// Output hash recorded when the target last built.
    pub build_hash: Blake3,
    /// Content fingerprints per source file.
    pub source_content: BTreeMap<PathBuf, Blake3>,
    /// Metadata fingerprints per source file (the fast path).
    pub source_metadata: BTreeMap<PathBuf, Blake3>,
    /// Output hashes of each dependency at record time.
    pub dep_hashes: BTreeMap<TargetId, Blake3>,
    /// When the entry was recorded (unix seconds).
    pub timestamp: i64,
    /// Last time the entry answered a lookup (unix seconds); drives LRU.
    pub last_access: i64,
}

impl CacheEntry {
    fn encode(&self, w: &mut Writer) {
        w.put_str(self.build_hash.as_str());
        w.put_u32(self.source_content.len() as u32);
        for (path, hash) in &self.source_content {
            w.put_str(&path.to_string_lossy()).put_str(hash.as_str());
        }
        w.put_u32(self.source_metadata.len() as u32);
        for (path, hash) in &self.source_metadata {
            w.put_str(&path.to_string_lossy()).put_str(hash.as_str());
        }
        w.put_u32(self.dep_hashes.len() as u32);
        for (id, hash) in &self.dep_hashes {
            encode_target_id(w, id);
            w.put_str(hash.as_str());
        }
        w.put_i64(self.timestamp).put_i64(self.last_access);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let build_hash = Blake3::from_hex(r.str()?)?;
        let mut source_content = BTreeMap::new();
        for _ in 0..r.u32()? {
            let path = PathBuf::from(r.str()?);
            source_content.insert(path, Blake3::from_hex(r.str()?)?);
        }
        let mut source_metadata = BTreeMap::new();
        for _ in 0..r.u32()? {
            let path = PathBuf::from(r.str()?);
            source_metadata.insert(path, Blake3::from_hex(r.str()?)?);
        }
        let mut dep_hashes = BTreeMap::new();
        for _ in 0..r.u32()? {
            let id = decode_target_id(r)?;
            dep_hashes.insert(id, Blake3::from_hex(r.str()?)?);
        }
        Ok(Self {
            build_hash,
            source_content,
            source_metadata,
            dep_hashes,
            timestamp: r.i64()?,
            last_access: r.i64()?,
        })
    }
}

/// Cache statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TargetId, CacheEntry>,
    dirty: bool,
    hits: u64,
    misses: u64,
    evicted: u64,
}

/// Persistent map from target fingerprint to recorded output hash.
///
/// All public methods take an internal mutex; hashing happens outside the
/// critical section so the lock is only ever held for map operations.
#[derive(Debug)]
pub struct BuildCache {
    path: PathBuf,
    key: WorkspaceKey,
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl BuildCache {
    /// Load the cache from disk, or start empty if the file is absent,
    /// tampered with, or expired.
    #[instrument(name = "BuildCache::load", skip(key, config))]
    pub async fn load(path: impl Into<PathBuf> + std::fmt::Debug, key: WorkspaceKey, config: CacheConfig) -> Self {
        let path = path.into();
        let max_age = Duration::from_secs(u64::from(config.max_age_days) * 24 * 60 * 60);

        let entries = match super::read_signed(&path, MAGIC, &key, max_age).await {
            Some(payload) => match decode_entries(&payload) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(?path, ?err, "undecodable build cache, starting fresh");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        debug!(?path, entries = entries.len(), "loaded build cache");
        Self {
            path,
            key,
            config,
            inner: Mutex::new(Inner {
                entries,
                ..Inner::default()
            }),
        }
    }

    /// Whether `target` is up to date for the given sources and current
    /// dependency output hashes. Touches `last_access` on a hit.
    #[instrument(name = "BuildCache::is_cached", skip(self, sources, deps))]
    pub async fn is_cached(
        &self,
        target: &TargetId,
        sources: &[PathBuf],
        deps: &[(TargetId, Blake3)],
    ) -> Result<bool> {
        let entry = {
            let mut inner = self.lock();
            match inner.entries.get(target) {
                Some(entry) => entry.clone(),
                None => {
                    inner.misses += 1;
                    return Ok(false);
                }
            }
        };

        // Dependency outputs must match exactly.
        let deps_match = deps.len() == entry.dep_hashes.len()
            && deps
                .iter()
                .all(|(id, hash)| entry.dep_hashes.get(id) == Some(hash));
        if !deps_match {
            trace!(%target, "cache miss: dependency outputs changed");
            self.lock().misses += 1;
            return Ok(false);
        }

        // The recorded source set must be exactly the current one.
        if sources.len() != entry.source_content.len()
            || !sources.iter().all(|s| entry.source_content.contains_key(s))
        {
            trace!(%target, "cache miss: source set changed");
            self.lock().misses += 1;
            return Ok(false);
        }

        let sources = sources.to_vec();
        let fresh = tokio::task::spawn_blocking(move || validate_sources(&entry, &sources))
            .await
            .context("join source validation")?;

        let mut inner = self.lock();
        if fresh {
            inner.hits += 1;
            if let Some(entry) = inner.entries.get_mut(target) {
                entry.last_access = Timestamp::now().as_second();
                inner.dirty = true;
            }
        } else {
            inner.misses += 1;
        }
        Ok(fresh)
    }

    /// Record a completed target build.
    ///
    /// Recomputes content and metadata fingerprints for every source, in
    /// parallel above a small threshold, then stores the entry.
    #[instrument(name = "BuildCache::update", skip(self, sources, deps))]
    pub async fn update(
        &self,
        target: &TargetId,
        sources: &[PathBuf],
        deps: &[(TargetId, Blake3)],
        output_hash: Blake3,
    ) -> Result<()> {
        let paths = sources.to_vec();
        let hashed = tokio::task::spawn_blocking(move || hash_sources(&paths))
            .await
            .context("join source hashing")??;

        let now = Timestamp::now().as_second();
        let entry = CacheEntry {
            build_hash: output_hash,
            source_content: hashed
                .iter()
                .map(|(path, content, _)| (path.clone(), content.clone()))
                .collect(),
            source_metadata: hashed
                .into_iter()
                .map(|(path, _, metadata)| (path, metadata))
                .collect(),
            dep_hashes: deps.iter().cloned().collect(),
            timestamp: now,
            last_access: now,
        };

        let mut inner = self.lock();
        inner.entries.insert(target.clone(), entry);
        inner.dirty = true;
        Ok(())
    }

    /// The recorded output hash for a target, if any.
    pub fn recorded_output(&self, target: &TargetId) -> Option<Blake3> {
        self.lock().entries.get(target).map(|e| e.build_hash.clone())
    }

    /// Drop a target's entry. Idempotent.
    #[instrument(name = "BuildCache::invalidate", skip(self))]
    pub fn invalidate(&self, target: &TargetId) {
        let mut inner = self.lock();
        if inner.entries.remove(target).is_some() {
            inner.dirty = true;
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        if !inner.entries.is_empty() {
            inner.entries.clear();
            inner.dirty = true;
        }
    }

    /// Persist to disk. A no-op when nothing changed since the last flush.
    ///
    /// With `run_eviction`, LRU entries are dropped until both the size and
    /// count bounds hold, and entries older than the max age are pruned.
    #[instrument(name = "BuildCache::flush", skip(self))]
    pub async fn flush(&self, run_eviction: bool) -> Result<()> {
        let payload = {
            let mut inner = self.lock();
            if !inner.dirty {
                trace!("clean cache, skipping flush");
                return Ok(());
            }

            if run_eviction {
                let evicted = evict(&mut inner.entries, &self.config);
                inner.evicted += evicted;
            }

            let payload = encode_entries(&inner.entries);
            inner.dirty = false;
            payload
        };

        super::write_signed(&self.path, MAGIC, &self.key, &payload).await
    }

    /// Flush with eviction and drop in-memory state.
    pub async fn close(&self) -> Result<()> {
        self.flush(true).await
    }

    pub fn stats(&self) -> BuildCacheStats {
        let inner = self.lock();
        BuildCacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evicted: inner.evicted,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("build cache lock poisoned")
    }
}

/// Re-fingerprint sources against an entry, metadata fast path first.
fn validate_sources(entry: &CacheEntry, sources: &[PathBuf]) -> bool {
    let check = |path: &PathBuf| -> bool {
        let prior_metadata = entry.source_metadata.get(path);
        let expected_content = entry.source_content.get(path);
        match hash::two_tier(path, prior_metadata) {
            Ok(two_tier) => match two_tier.content {
                // Metadata unchanged: the fast path accepts.
                None => true,
                // Metadata changed: content decides.
                Some(content) => expected_content == Some(&content),
            },
            // Unreadable (deleted, permissions): definitely not cached.
            Err(_) => false,
        }
    };

    if sources.len() > PARALLEL_HASH_THRESHOLD {
        sources.par_iter().all(check)
    } else {
        sources.iter().all(check)
    }
}

type HashedSource = (PathBuf, Blake3, Blake3);

fn hash_sources(paths: &[PathBuf]) -> Result<Vec<HashedSource>> {
    let hash_one = |path: &PathBuf| -> Result<HashedSource> {
        let content = hash::content_fingerprint(path)?;
        let metadata = hash::metadata_fingerprint(path)?;
        Ok((path.clone(), content, metadata))
    };

    if paths.len() > PARALLEL_HASH_THRESHOLD {
        paths.par_iter().map(hash_one).collect()
    } else {
        paths.iter().map(hash_one).collect()
    }
}

fn encode_entries(entries: &HashMap<TargetId, CacheEntry>) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(entries.len() as u32);
    for (id, entry) in entries {
        encode_target_id(&mut w, id);
        entry.encode(&mut w);
    }
    w.finish()
}

fn decode_entries(payload: &[u8]) -> Result<HashMap<TargetId, CacheEntry>> {
    let mut r = Reader::new(payload);
    let count = r.u32()? as usize;
    let mut entries = HashMap::with_capacity(count);
    for _ in 0..count {
        let id = decode_target_id(&mut r)?;
        entries.insert(id, CacheEntry::decode(&mut r)?);
    }
    Ok(entries)
}

/// Prune aged entries, then drop LRU entries until both bounds hold.
/// Returns the number of entries removed.
fn evict(entries: &mut HashMap<TargetId, CacheEntry>, config: &CacheConfig) -> u64 {
    let before = entries.len();
    let now = Timestamp::now().as_second();
    let max_age_secs = i64::from(config.max_age_days) * 24 * 60 * 60;
    entries.retain(|_, entry| now.saturating_sub(entry.timestamp) <= max_age_secs);

    // Exact serialized sizes, so the size bound matches what lands on disk.
    let mut sized: Vec<(TargetId, i64, usize)> = entries
        .iter()
        .map(|(id, entry)| {
            let mut w = Writer::new();
            encode_target_id(&mut w, id);
            entry.encode(&mut w);
            (id.clone(), entry.last_access, w.len())
        })
        .collect();
    // Oldest access first.
    sized.sort_by_key(|(_, last_access, _)| *last_access);

    let mut total: usize = sized.iter().map(|(_, _, size)| size).sum();
    let mut victims = sized.into_iter();
    while entries.len() > config.max_entries || total as u64 > config.max_size {
        let Some((id, _, size)) = victims.next() else {
            break;
        };
        entries.remove(&id);
        total -= size;
    }

    (before - entries.len()) as u64
}
