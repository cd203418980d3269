//! Checkpoint and resume.
//!
//! During a build, node states are periodically captured and persisted so a
//! later invocation can skip completed targets. The on-disk format is the
//! shared signed-envelope discipline with the `CKPT` magic (zero-padded to
//! the common 8-byte width).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Result;
use jiff::Timestamp;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache,
    codec::{Reader, Writer},
    error::{BuildError, ErrorKind},
    fs,
    graph::{BuildGraph, NodeStatus, decode_target_id, encode_target_id},
    hash::Blake3,
    integrity::WorkspaceKey,
    target::TargetId,
};

const MAGIC: &[u8; 8] = b"CKPT\0\0\0\0";

/// Checkpoints older than this are flagged stale.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Write a checkpoint every this many completed targets...
pub const CHECKPOINT_EVERY_COMPLETIONS: usize = 5;
/// ...or at least this often.
pub const CHECKPOINT_EVERY: Duration = Duration::from_secs(30);

/// A serialized snapshot of partial build state.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Checkpoint {
    pub workspace_root: PathBuf,
    /// Unix seconds at capture time.
    pub timestamp: i64,
    pub total_targets: u32,
    pub completed_targets: u32,
    pub failed_targets: Vec<TargetId>,
    pub node_states: BTreeMap<TargetId, NodeStatus>,
    pub node_hashes: BTreeMap<TargetId, Blake3>,
}

impl Checkpoint {
    /// Snapshot the current state of a graph.
    #[instrument(name = "Checkpoint::capture", skip(graph))]
    pub fn capture(graph: &BuildGraph, workspace_root: &Path) -> Self {
        let mut node_states = BTreeMap::new();
        let mut node_hashes = BTreeMap::new();
        let mut failed_targets = Vec::new();
        let mut completed = 0u32;

        for node in graph.nodes() {
            let status = node.status();
            node_states.insert(node.id().clone(), status);
            if status.is_complete_ok() {
                completed += 1;
            }
            if status == NodeStatus::Failed {
                failed_targets.push(node.id().clone());
            }
            if let Some(hash) = node.output_hash() {
                node_hashes.insert(node.id().clone(), hash);
            }
        }
        failed_targets.sort();

        Self {
            workspace_root: workspace_root.to_path_buf(),
            timestamp: Timestamp::now().as_second(),
            total_targets: graph.len() as u32,
            completed_targets: completed,
            failed_targets,
            node_states,
            node_hashes,
        }
    }

    /// Whether this checkpoint is older than [`STALE_AFTER`].
    pub fn is_stale(&self) -> bool {
        let age = Timestamp::now().as_second().saturating_sub(self.timestamp);
        age > STALE_AFTER.as_secs() as i64
    }

    /// Validate this checkpoint against a freshly constructed graph.
    ///
    /// Node counts must match and every checkpoint-known target must still
    /// exist; otherwise the sources changed too much to trust the snapshot.
    #[instrument(name = "Checkpoint::validate_against", skip_all)]
    pub fn validate_against(&self, graph: &BuildGraph) -> Result<()> {
        if self.total_targets as usize != graph.len() {
            return Err(BuildError::new(
                ErrorKind::CacheCorrupted,
                format!(
                    "checkpoint covers {} targets but the graph has {}",
                    self.total_targets,
                    graph.len(),
                ),
            )
            .suggest("run `builder clean` and start a fresh build")
            .into());
        }
        for id in self.node_states.keys() {
            if graph.node(id).is_none() {
                return Err(BuildError::new(
                    ErrorKind::NodeNotFound,
                    format!("checkpoint references {id}, which no longer exists"),
                )
                .suggest("run `builder clean` and start a fresh build")
                .into());
            }
        }
        Ok(())
    }

    /// Restore completed state into a graph: `Success` and `Cached` nodes
    /// keep their status and output hash; `Failed` and `Pending` nodes will
    /// retry. Returns how many nodes were restored.
    #[instrument(name = "Checkpoint::merge_into", skip_all)]
    pub fn merge_into(&self, graph: &BuildGraph) -> usize {
        let mut restored = 0;
        for (id, status) in &self.node_states {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if status.is_complete_ok() {
                // Resumed completions count as cache restores.
                node.set_status(NodeStatus::Cached);
                if let Some(hash) = self.node_hashes.get(id) {
                    node.set_output_hash(hash.clone());
                }
                restored += 1;
            }
        }
        info!(restored, total = self.total_targets, "merged checkpoint");
        restored
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_str(&self.workspace_root.to_string_lossy());
        w.put_i64(self.timestamp);
        w.put_u32(self.total_targets);
        w.put_u32(self.completed_targets);
        w.put_u32(self.node_states.len() as u32);
        for (id, status) in &self.node_states {
            encode_target_id(&mut w, id);
            w.put_u8(status.as_u8());
        }
        w.put_u32(self.node_hashes.len() as u32);
        for (id, hash) in &self.node_hashes {
            encode_target_id(&mut w, id);
            w.put_str(hash.as_str());
        }
        w.put_u32(self.failed_targets.len() as u32);
        for id in &self.failed_targets {
            encode_target_id(&mut w, id);
        }
        w.finish()
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let workspace_root = PathBuf::from(r.str()?);
        let timestamp = r.i64()?;
        let total_targets = r.u32()?;
        let completed_targets = r.u32()?;

        let mut node_states = BTreeMap::new();
        for _ in 0..r.u32()? {
            let id = decode_target_id(&mut r)?;
            let status = NodeStatus::from_u8(r.u8()?).ok_or_else(|| {
                BuildError::new(ErrorKind::CacheCorrupted, "unknown node status in checkpoint")
            })?;
            node_states.insert(id, status);
        }
        let mut node_hashes = BTreeMap::new();
        for _ in 0..r.u32()? {
            let id = decode_target_id(&mut r)?;
            node_hashes.insert(id, Blake3::from_hex(r.str()?)?);
        }
        let mut failed_targets = Vec::new();
        for _ in 0..r.u32()? {
            failed_targets.push(decode_target_id(&mut r)?);
        }

        Ok(Self {
            workspace_root,
            timestamp,
            total_targets,
            completed_targets,
            failed_targets,
            node_states,
            node_hashes,
        })
    }

    /// Persist to `path`, signed.
    #[instrument(name = "Checkpoint::write", skip(self, key))]
    pub async fn write(&self, path: &Path, key: &WorkspaceKey) -> Result<()> {
        cache::write_signed(path, MAGIC, key, &self.encode()).await
    }

    /// Load from `path`. `None` when absent, tampered, or undecodable.
    #[instrument(name = "Checkpoint::load", skip(key))]
    pub async fn load(path: &Path, key: &WorkspaceKey) -> Option<Self> {
        // Staleness is judged separately (with user confirmation), so the
        // envelope itself only enforces the broad cache age bound.
        let payload =
            cache::read_signed(path, MAGIC, key, crate::integrity::DEFAULT_MAX_AGE).await?;
        match Self::decode(&payload) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!(?path, ?err, "undecodable checkpoint, ignoring");
                None
            }
        }
    }

    /// Remove the checkpoint file; called after a clean full build.
    #[instrument(name = "Checkpoint::clear")]
    pub async fn clear(path: &Path) -> Result<()> {
        debug!(?path, "clearing checkpoint");
        fs::remove_file_idempotent(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::ValidationMode,
        target::{Target, TargetKind},
    };
    use pretty_assertions::assert_eq;

    fn tid(name: &str) -> TargetId {
        TargetId::new("ws", "pkg", name)
    }

    fn linear_graph(names: &[&str]) -> BuildGraph {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        for (i, name) in names.iter().enumerate() {
            let mut target = Target::new(tid(name), TargetKind::Library, "c");
            if i > 0 {
                target.deps.push(tid(names[i - 1]));
            }
            graph.add_target(target).unwrap();
        }
        graph.validate().unwrap();
        graph
    }

    #[test_log::test(tokio::test)]
    async fn capture_write_load_merge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        let key = WorkspaceKey::for_tests();

        let graph = linear_graph(&["a", "b", "c"]);
        graph.node(&tid("a")).unwrap().set_status(NodeStatus::Success);
        graph
            .node(&tid("a"))
            .unwrap()
            .set_output_hash(Blake3::from_buffer(b"out-a"));
        graph.node(&tid("b")).unwrap().set_status(NodeStatus::Failed);

        let checkpoint = Checkpoint::capture(&graph, dir.path());
        assert_eq!(checkpoint.completed_targets, 1);
        assert_eq!(checkpoint.failed_targets, vec![tid("b")]);
        checkpoint.write(&path, &key).await.unwrap();

        let loaded = Checkpoint::load(&path, &key).await.unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(!loaded.is_stale());

        // Merge into a fresh graph: completed nodes come back as Cached
        // with their hash; failed nodes stay pending for retry.
        let fresh = linear_graph(&["a", "b", "c"]);
        loaded.validate_against(&fresh).unwrap();
        assert_eq!(loaded.merge_into(&fresh), 1);

        let a = fresh.node(&tid("a")).unwrap();
        assert_eq!(a.status(), NodeStatus::Cached);
        assert_eq!(a.output_hash(), Some(Blake3::from_buffer(b"out-a")));
        assert_eq!(fresh.node(&tid("b")).unwrap().status(), NodeStatus::Pending);
        assert_eq!(fresh.node(&tid("c")).unwrap().status(), NodeStatus::Pending);
    }

    #[test_log::test(tokio::test)]
    async fn mismatched_graph_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let graph = linear_graph(&["a", "b", "c"]);
        let checkpoint = Checkpoint::capture(&graph, dir.path());

        // Different node count.
        let smaller = linear_graph(&["a", "b"]);
        let err = checkpoint.validate_against(&smaller).unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::CacheCorrupted,
        );

        // Same count, renamed target.
        let renamed = linear_graph(&["a", "b", "z"]);
        let err = checkpoint.validate_against(&renamed).unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::NodeNotFound,
        );
    }

    #[test_log::test(tokio::test)]
    async fn stale_checkpoints_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let graph = linear_graph(&["a"]);
        let mut checkpoint = Checkpoint::capture(&graph, dir.path());
        checkpoint.timestamp -= (STALE_AFTER.as_secs() as i64) + 60;
        assert!(checkpoint.is_stale());
    }

    #[test_log::test(tokio::test)]
    async fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        Checkpoint::clear(&path).await.unwrap();

        let graph = linear_graph(&["a"]);
        let checkpoint = Checkpoint::capture(&graph, dir.path());
        checkpoint.write(&path, &WorkspaceKey::for_tests()).await.unwrap();
        Checkpoint::clear(&path).await.unwrap();
        Checkpoint::clear(&path).await.unwrap();
        assert!(Checkpoint::load(&path, &WorkspaceKey::for_tests()).await.is_none());
    }
}
