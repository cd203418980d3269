//! The action cache: file-level reuse beneath the target level.
//!
//! Where the build cache answers for a whole target, the action cache
//! answers for a single tool invocation (one `.o` per source, one link, one
//! test run), so touching one file in a ten-file target re-runs one compile.
//!
//! Failures are recorded too, with a short TTL: re-running a compile error
//! within a few minutes of an identical input set is wasted work, but stale
//! negative entries must not mask a fixed toolchain.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use color_eyre::Result;
use derive_more::Display;
use jiff::Timestamp;
use tracing::{debug, instrument, trace, warn};

use crate::{
    codec::{Reader, Writer},
    config::CacheConfig,
    graph::{decode_target_id, encode_target_id},
    hash::Blake3,
    integrity::WorkspaceKey,
    target::TargetId,
};

const MAGIC: &[u8; 8] = b"BLDACTN\0";

/// The kind of tool invocation an action represents.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum ActionKind {
    #[display("compile")]
    Compile,
    #[display("link")]
    Link,
    #[display("test")]
    Test,
    #[display("custom")]
    Custom,
}

impl ActionKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Compile => 0,
            Self::Link => 1,
            Self::Test => 2,
            Self::Custom => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Compile),
            1 => Some(Self::Link),
            2 => Some(Self::Test),
            3 => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Identifies one action: target, kind, per-file disambiguator, and a
/// fingerprint over the action's inputs.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{target}#{kind}:{sub_id}@{}", input_hash.shard())]
pub struct ActionId {
    pub target: TargetId,
    pub kind: ActionKind,
    /// Disambiguates per-file actions within a target, e.g. the source path.
    pub sub_id: String,
    pub input_hash: Blake3,
}

impl ActionId {
    pub fn encode(&self, w: &mut Writer) {
        encode_target_id(w, &self.target);
        w.put_u8(self.kind.as_u8());
        w.put_str(&self.sub_id);
        w.put_str(self.input_hash.as_str());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let target = decode_target_id(r)?;
        let kind = ActionKind::from_u8(r.u8()?)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown action kind"))?;
        let sub_id = r.str()?.to_string();
        let input_hash = Blake3::from_hex(r.str()?)?;
        Ok(Self {
            target,
            kind,
            sub_id,
            input_hash,
        })
    }
}

/// One output artifact of an action.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ActionOutput {
    pub path: PathBuf,
    pub hash: Blake3,
}

/// A recorded action execution.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ActionRecord {
    /// Input fingerprints at execution time.
    pub inputs: BTreeMap<PathBuf, Blake3>,
    /// Produced artifacts, CAS-addressed.
    pub outputs: Vec<ActionOutput>,
    /// Free-form metadata (tool version, flags digest).
    pub metadata: BTreeMap<String, String>,
    pub success: bool,
    /// Unix seconds; bounds the negative-cache TTL.
    pub recorded_at: i64,
}

impl ActionRecord {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.inputs.len() as u32);
        for (path, hash) in &self.inputs {
            w.put_str(&path.to_string_lossy()).put_str(hash.as_str());
        }
        w.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            w.put_str(&output.path.to_string_lossy()).put_str(output.hash.as_str());
        }
        w.put_u32(self.metadata.len() as u32);
        for (key, value) in &self.metadata {
            w.put_str(key).put_str(value);
        }
        w.put_bool(self.success).put_i64(self.recorded_at);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mut inputs = BTreeMap::new();
        for _ in 0..r.u32()? {
            let path = PathBuf::from(r.str()?);
            inputs.insert(path, Blake3::from_hex(r.str()?)?);
        }
        let mut outputs = Vec::new();
        for _ in 0..r.u32()? {
            outputs.push(ActionOutput {
                path: PathBuf::from(r.str()?),
                hash: Blake3::from_hex(r.str()?)?,
            });
        }
        let mut metadata = BTreeMap::new();
        for _ in 0..r.u32()? {
            let key = r.str()?.to_string();
            let value = r.str()?.to_string();
            metadata.insert(key, value);
        }
        Ok(Self {
            inputs,
            outputs,
            metadata,
            success: r.bool()?,
            recorded_at: r.i64()?,
        })
    }
}

/// Cache statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub negative_entries: usize,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ActionId, ActionRecord>,
    dirty: bool,
    hits: u64,
    misses: u64,
}

/// Persistent map from action fingerprint to recorded outputs.
#[derive(Debug)]
pub struct ActionCache {
    path: PathBuf,
    key: WorkspaceKey,
    failure_ttl: Duration,
    max_age: Duration,
    inner: Mutex<Inner>,
}

impl ActionCache {
    /// Load from disk; absent, tampered, or expired files start empty.
    #[instrument(name = "ActionCache::load", skip(key, config))]
    pub async fn load(path: impl Into<PathBuf> + std::fmt::Debug, key: WorkspaceKey, config: &CacheConfig) -> Self {
        let path = path.into();
        let max_age = Duration::from_secs(u64::from(config.max_age_days) * 24 * 60 * 60);

        let records = match super::read_signed(&path, MAGIC, &key, max_age).await {
            Some(payload) => match decode_records(&payload) {
                Ok(records) => records,
                Err(err) => {
                    warn!(?path, ?err, "undecodable action cache, starting fresh");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        debug!(?path, records = records.len(), "loaded action cache");
        Self {
            path,
            key,
            failure_ttl: config.failure_ttl,
            max_age,
            inner: Mutex::new(Inner {
                records,
                ..Inner::default()
            }),
        }
    }

    /// Whether the action's recorded execution can be reused for the given
    /// inputs. Failed records only answer within the failure TTL.
    #[instrument(name = "ActionCache::is_cached", skip(self, inputs))]
    pub fn is_cached(&self, id: &ActionId, inputs: &BTreeMap<PathBuf, Blake3>) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.records.get(id) else {
            inner.misses += 1;
            return false;
        };

        if record.inputs != *inputs {
            inner.misses += 1;
            return false;
        }

        if !record.success {
            let age = Timestamp::now().as_second().saturating_sub(record.recorded_at);
            if age > self.failure_ttl.as_secs() as i64 {
                trace!(%id, age, "negative entry expired");
                inner.records.remove(id);
                inner.dirty = true;
                inner.misses += 1;
                return false;
            }
        }

        inner.hits += 1;
        true
    }

    /// The recorded execution for an action, if present and still valid.
    pub fn get(&self, id: &ActionId) -> Option<ActionRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Record an action execution.
    #[instrument(name = "ActionCache::update", skip_all, fields(%id, success))]
    pub fn update(
        &self,
        id: ActionId,
        inputs: BTreeMap<PathBuf, Blake3>,
        outputs: Vec<ActionOutput>,
        metadata: BTreeMap<String, String>,
        success: bool,
    ) {
        let record = ActionRecord {
            inputs,
            outputs,
            metadata,
            success,
            recorded_at: Timestamp::now().as_second(),
        };
        let mut inner = self.lock();
        inner.records.insert(id, record);
        inner.dirty = true;
    }

    /// Drop every record for a target.
    pub fn invalidate_target(&self, target: &TargetId) {
        let mut inner = self.lock();
        let before = inner.records.len();
        inner.records.retain(|id, _| id.target != *target);
        if inner.records.len() != before {
            inner.dirty = true;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        if !inner.records.is_empty() {
            inner.records.clear();
            inner.dirty = true;
        }
    }

    /// Persist to disk, dropping expired negative entries first.
    #[instrument(name = "ActionCache::flush", skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let payload = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }

            let now = Timestamp::now().as_second();
            let ttl = self.failure_ttl.as_secs() as i64;
            let max_age = self.max_age.as_secs() as i64;
            inner.records.retain(|_, record| {
                let age = now.saturating_sub(record.recorded_at);
                if record.success {
                    age <= max_age
                } else {
                    age <= ttl
                }
            });

            let payload = encode_records(&inner.records);
            inner.dirty = false;
            payload
        };

        super::write_signed(&self.path, MAGIC, &self.key, &payload).await
    }

    pub fn stats(&self) -> ActionCacheStats {
        let inner = self.lock();
        ActionCacheStats {
            entries: inner.records.len(),
            hits: inner.hits,
            misses: inner.misses,
            negative_entries: inner.records.values().filter(|r| !r.success).count(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("action cache lock poisoned")
    }
}

fn encode_records(records: &HashMap<ActionId, ActionRecord>) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(records.len() as u32);
    for (id, record) in records {
        id.encode(&mut w);
        record.encode(&mut w);
    }
    w.finish()
}

fn decode_records(payload: &[u8]) -> Result<HashMap<ActionId, ActionRecord>> {
    let mut r = Reader::new(payload);
    let count = r.u32()? as usize;
    let mut records = HashMap::with_capacity(count.min(4096));
    for _ in 0..count {
        let id = ActionId::decode(&mut r)?;
        records.insert(id, ActionRecord::decode(&mut r)?);
    }
    Ok(records)
}
