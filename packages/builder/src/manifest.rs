//! Target manifest loading.
//!
//! The Builderfile DSL and its parser live outside the engine; what crosses
//! the boundary is a plain declaration list. `builder.json` at the
//! workspace root carries that list, and this module turns it into targets
//! plus the Builderfile hash that keys the graph cache.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    error::{BuildError, ErrorKind},
    fs,
    graph::{BuildGraph, ValidationMode},
    hash::Blake3,
    target::{Target, TargetId, TargetKind},
};

/// Manifest file name at the workspace root.
pub const MANIFEST_NAME: &str = "builder.json";

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    workspace: String,
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    name: String,
    #[serde(default)]
    path: String,
    kind: TargetKind,
    language: String,
    #[serde(default)]
    sources: Vec<PathBuf>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    output: Option<PathBuf>,
    #[serde(default)]
    config: std::collections::BTreeMap<String, String>,
}

/// A loaded manifest: targets plus the hash keying the graph cache.
#[derive(Debug)]
pub struct Manifest {
    pub targets: Vec<Target>,
    /// Hash over the manifest bytes; changes whenever declarations change.
    pub builderfile_hash: Blake3,
}

impl Manifest {
    /// Load and decode `builder.json` from the workspace root.
    #[instrument(name = "Manifest::load")]
    pub async fn load(workspace: &Path) -> Result<Self> {
        let path = workspace.join(MANIFEST_NAME);
        let bytes = fs::read_opt(&path).await?.ok_or_else(|| {
            BuildError::new(
                ErrorKind::TargetNotFound,
                format!("no {MANIFEST_NAME} in {workspace:?}"),
            )
            .suggest("create a builder.json declaring your targets")
        })?;
        let builderfile_hash = Blake3::from_buffer(&bytes);

        let raw: RawManifest =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {path:?}"))?;

        let mut targets = Vec::with_capacity(raw.targets.len());
        for decl in raw.targets {
            let id = TargetId::new(raw.workspace.clone(), decl.path, decl.name);
            let mut target = Target::new(id, decl.kind, decl.language);
            target.sources = decl.sources;
            target.env = decl.env;
            target.output_hint = decl.output;
            target.config = decl.config;
            for dep in decl.deps {
                // Bare names refer to siblings in this workspace.
                let dep_id = match TargetId::parse(&dep)? {
                    id if id.workspace.is_empty() && id.path.is_empty() => {
                        TargetId::new(raw.workspace.clone(), "", id.name)
                    }
                    id if id.workspace.is_empty() => {
                        TargetId::new(raw.workspace.clone(), id.path, id.name)
                    }
                    id => id,
                };
                target.deps.push(dep_id);
            }
            targets.push(target);
        }

        debug!(targets = targets.len(), "loaded manifest");
        Ok(Self {
            targets,
            builderfile_hash,
        })
    }

    /// Build and validate the dependency graph from the declarations.
    pub fn into_graph(self) -> Result<BuildGraph> {
        let mut graph = BuildGraph::new(ValidationMode::Deferred);
        for target in self.targets {
            graph.add_target(target)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Resolve a user-supplied target reference against the declarations.
    pub fn resolve(&self, reference: &str) -> Result<TargetId> {
        let parsed = TargetId::parse(reference)?;
        if self.targets.iter().any(|t| t.id == parsed) {
            return Ok(parsed);
        }
        // Bare-name convenience: unique match on name alone.
        let matches: Vec<&Target> = self
            .targets
            .iter()
            .filter(|t| t.id.name == parsed.name)
            .collect();
        match matches.as_slice() {
            [single] => Ok(single.id.clone()),
            [] => Err(BuildError::new(
                ErrorKind::TargetNotFound,
                format!("no target named {reference:?}"),
            )
            .suggest("run `builder graph` to list declared targets")
            .into()),
            _ => Err(BuildError::new(
                ErrorKind::TargetNotFound,
                format!("ambiguous target {reference:?}: qualify with //path:name"),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "workspace": "mono",
        "targets": [
            {
                "name": "core",
                "path": "lib/core",
                "kind": "library",
                "language": "c",
                "sources": ["lib/core/core.c"]
            },
            {
                "name": "app",
                "path": "app",
                "kind": "executable",
                "language": "c",
                "sources": ["app/main.c"],
                "deps": ["//lib/core:core"]
            }
        ]
    }"#;

    async fn write_manifest(dir: &Path) {
        tokio::fs::write(dir.join(MANIFEST_NAME), MANIFEST).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn manifest_builds_a_valid_graph() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path()).await;

        let manifest = Manifest::load(dir.path()).await.unwrap();
        assert_eq!(manifest.targets.len(), 2);

        let app = manifest.resolve("app").unwrap();
        assert_eq!(app, TargetId::new("mono", "app", "app"));

        let graph = manifest.into_graph().unwrap();
        assert_eq!(graph.len(), 2);
        let app_node = graph.node(&app).unwrap();
        assert_eq!(app_node.deps(), &[TargetId::new("mono", "lib/core", "core")]);
    }

    #[test_log::test(tokio::test)]
    async fn missing_manifest_is_a_target_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(dir.path()).await.unwrap_err();
        assert_eq!(
            BuildError::from_report(&err).unwrap().kind(),
            ErrorKind::TargetNotFound,
        );
    }

    #[test_log::test(tokio::test)]
    async fn hash_tracks_manifest_content() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path()).await;
        let first = Manifest::load(dir.path()).await.unwrap().builderfile_hash;

        tokio::fs::write(dir.path().join(MANIFEST_NAME), MANIFEST.replace("app", "cli"))
            .await
            .unwrap();
        let second = Manifest::load(dir.path()).await.unwrap().builderfile_hash;
        assert_ne!(first, second);
    }
}
