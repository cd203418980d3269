//! The graph cache: skip the analysis pass when nothing declared changed.
//!
//! The constructed dependency graph is serialized keyed by a hash over every
//! Builderfile. On the next invocation, a matching key plus a valid
//! signature loads the graph directly; anything else reconstructs it.

use std::{path::PathBuf, time::Duration};

use color_eyre::Result;
use tracing::{debug, instrument, warn};

use crate::{
    codec::{Reader, Writer},
    config::CacheConfig,
    graph::BuildGraph,
    hash::Blake3,
    integrity::WorkspaceKey,
};

const MAGIC: &[u8; 8] = b"BLDGRAPH";

/// Serializes the dependency graph across invocations.
#[derive(Debug)]
pub struct GraphCache {
    path: PathBuf,
    key: WorkspaceKey,
    max_age: Duration,
}

impl GraphCache {
    pub fn new(path: impl Into<PathBuf>, key: WorkspaceKey, config: &CacheConfig) -> Self {
        Self {
            path: path.into(),
            key,
            max_age: Duration::from_secs(u64::from(config.max_age_days) * 24 * 60 * 60),
        }
    }

    /// Store the graph under the combined Builderfile hash.
    #[instrument(name = "GraphCache::store", skip(self, graph))]
    pub async fn store(&self, builderfile_key: &Blake3, graph: &BuildGraph) -> Result<()> {
        let mut w = Writer::new();
        w.put_str(builderfile_key.as_str());
        w.put_bytes(&graph.serialize());
        super::write_signed(&self.path, MAGIC, &self.key, &w.finish()).await
    }

    /// Load the graph if the stored key matches and the signature is valid.
    #[instrument(name = "GraphCache::load", skip(self))]
    pub async fn load(&self, builderfile_key: &Blake3) -> Option<BuildGraph> {
        let payload = super::read_signed(&self.path, MAGIC, &self.key, self.max_age).await?;

        let mut r = Reader::new(&payload);
        let decoded: Result<(Blake3, BuildGraph)> = (|| {
            let stored_key = Blake3::from_hex(r.str()?)?;
            let graph = BuildGraph::deserialize(r.bytes()?)?;
            Ok((stored_key, graph))
        })();

        match decoded {
            Ok((stored_key, graph)) if stored_key == *builderfile_key => {
                debug!(nodes = graph.len(), "graph cache hit");
                Some(graph)
            }
            Ok(_) => {
                debug!("graph cache key mismatch: Builderfiles changed");
                None
            }
            Err(err) => {
                warn!(?err, "undecodable graph cache, reconstructing");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::ValidationMode,
        target::{Target, TargetId, TargetKind},
    };
    use pretty_assertions::assert_eq;

    fn sample_graph() -> BuildGraph {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        let lib = TargetId::new("ws", "lib", "lib");
        let app = TargetId::new("ws", "app", "app");
        graph
            .add_target(Target::new(lib.clone(), TargetKind::Library, "c"))
            .unwrap();
        let mut app_target = Target::new(app, TargetKind::Executable, "c");
        app_target.deps.push(lib);
        graph.add_target(app_target).unwrap();
        graph.validate().unwrap();
        graph
    }

    #[test_log::test(tokio::test)]
    async fn store_then_load_on_matching_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GraphCache::new(
            dir.path().join("graph.bin"),
            WorkspaceKey::for_tests(),
            &CacheConfig::default(),
        );
        let key = Blake3::from_buffer(b"all builderfiles");
        let graph = sample_graph();

        cache.store(&key, &graph).await.unwrap();
        let loaded = cache.load(&key).await.unwrap();
        assert_eq!(loaded.len(), graph.len());

        // A different Builderfile hash forces reconstruction.
        let other = Blake3::from_buffer(b"edited builderfiles");
        assert!(cache.load(&other).await.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn missing_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GraphCache::new(
            dir.path().join("graph.bin"),
            WorkspaceKey::for_tests(),
            &CacheConfig::default(),
        );
        assert!(cache.load(&Blake3::from_buffer(b"key")).await.is_none());
    }
}
