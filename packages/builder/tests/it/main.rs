//! Integration harness: a scripted handler plus workspace scaffolding.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use color_eyre::Result;
use tempfile::TempDir;

use builder::{
    cache::{ActionId, ActionKind},
    config::CacheConfig,
    graph::{BuildGraph, ValidationMode},
    handler::{BuildContext, LanguageBuildResult, LanguageHandler, RecordedAction},
    hash::Blake3,
    services::BuildServices,
    target::{Target, TargetId, TargetKind},
};

pub mod cache;
pub mod distributed;
pub mod incremental;
pub mod resume;
pub mod steal;

/// A deterministic in-process handler for the `script` language.
///
/// "Builds" a target by concatenating its sources into `<name>.out` under
/// the workspace, and fails for any source containing the marker string
/// `FAIL`. Invocations are counted so tests can assert on cache behavior.
pub struct ScriptedHandler {
    invocations: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Self {
                invocations: Arc::clone(&invocations),
            },
            invocations,
        )
    }
}

impl LanguageHandler for ScriptedHandler {
    fn language(&self) -> &str {
        "script"
    }

    fn build(&self, ctx: &BuildContext) -> Result<LanguageBuildResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let mut combined = Vec::new();
        let mut inputs = BTreeMap::new();
        for source in &ctx.target.sources {
            let path = ctx.workspace.join(source);
            let content = std::fs::read(&path)?;
            if content.windows(4).any(|w| w == b"FAIL") {
                return Ok(LanguageBuildResult::failed(format!(
                    "scripted compile error in {source:?}",
                )));
            }
            inputs.insert(source.clone(), Blake3::from_buffer(&content));
            combined.extend_from_slice(&content);
        }

        let output = PathBuf::from(format!("{}.out", ctx.target.id.name));
        std::fs::write(ctx.workspace.join(&output), &combined)?;
        let output_hash = Blake3::from_buffer(&combined);

        (ctx.recorder)(RecordedAction {
            id: ActionId {
                target: ctx.target.id.clone(),
                kind: ActionKind::Compile,
                sub_id: String::new(),
                input_hash: Blake3::from_fields(inputs.values()),
            },
            inputs,
            outputs: Vec::new(),
            metadata: BTreeMap::new(),
            success: true,
        });

        Ok(LanguageBuildResult {
            success: true,
            error: None,
            output_hash: Some(output_hash),
            outputs: vec![output],
        })
    }
}

/// A scratch workspace populated with the given files.
pub fn scripted_workspace(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("create temporary workspace");
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create source directory");
        }
        std::fs::write(path, content).expect("write source file");
    }
    let root = dir.path().canonicalize().expect("canonicalize workspace");
    (dir, root)
}

/// Services with a fresh scripted handler registered; returns the
/// invocation counter.
pub async fn scripted_services(workspace: &Path) -> (Arc<BuildServices>, Arc<AtomicUsize>) {
    let services = BuildServices::initialize(workspace, CacheConfig::default())
        .await
        .expect("initialize services");
    let (handler, invocations) = ScriptedHandler::new();
    services.handlers.register(Arc::new(handler));
    (services, invocations)
}

pub fn tid(name: &str) -> TargetId {
    TargetId::new("it", "pkg", name)
}

/// A target in the `script` language with the given sources and deps.
pub fn script_target(name: &str, sources: &[&str], deps: &[&str]) -> Target {
    let mut target = Target::new(tid(name), TargetKind::Library, "script");
    target.sources = sources.iter().map(PathBuf::from).collect();
    target.deps = deps.iter().map(|d| tid(d)).collect();
    target
}

/// A validated graph over the given targets.
pub fn graph_of(targets: Vec<Target>) -> BuildGraph {
    let mut graph = BuildGraph::new(ValidationMode::Deferred);
    for target in targets {
        graph.add_target(target).expect("add target");
    }
    graph.validate().expect("validate graph");
    graph
}
