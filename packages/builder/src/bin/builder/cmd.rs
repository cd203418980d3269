//! Subcommand implementations.

pub mod build;
pub mod clean;
pub mod graph;
pub mod query;
pub mod resume;

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use color_eyre::{Result, eyre::Context};
use tracing::info;

use builder::{
    analyzer::IncludeScanner,
    config::CacheConfig,
    graph::{BuildGraph, ValidationMode},
    handler::CommandHandler,
    manifest::Manifest,
    services::BuildServices,
    target::TargetId,
};

/// The workspace root: the current directory, canonicalized.
pub fn workspace_root() -> Result<PathBuf> {
    std::env::current_dir().context("determine current directory")
}

/// Open services against the current workspace, with the generic command
/// handler and import scanner registered for every declared language.
pub async fn open_services(manifest: &Manifest) -> Result<Arc<BuildServices>> {
    let workspace = workspace_root()?;
    let services = BuildServices::initialize(&workspace, CacheConfig::from_env()).await?;

    let mut languages = BTreeSet::new();
    for target in &manifest.targets {
        languages.insert(target.language.clone());
    }
    for language in languages {
        services
            .handlers
            .register(Arc::new(CommandHandler::new(language.clone())));
        services
            .analyzers
            .register(Arc::new(IncludeScanner::new(language)));
    }
    Ok(services)
}

/// Construct the graph, going through the graph cache when the Builderfiles
/// are unchanged.
pub async fn load_graph(services: &BuildServices, manifest: Manifest) -> Result<BuildGraph> {
    if let Some(graph) = services.graph_cache.load(&manifest.builderfile_hash).await {
        info!("dependency graph loaded from cache");
        return Ok(graph);
    }

    let hash = manifest.builderfile_hash.clone();
    let graph = manifest.into_graph()?;
    services.graph_cache.store(&hash, &graph).await?;
    Ok(graph)
}

/// Restrict a graph to `root` and its transitive dependencies.
pub fn subgraph(graph: &BuildGraph, root: &TargetId) -> Result<BuildGraph> {
    let mut keep = BTreeSet::new();
    let mut stack = vec![root.clone()];
    while let Some(id) = stack.pop() {
        if !keep.insert(id.clone()) {
            continue;
        }
        let node = graph.must_node(&id)?;
        stack.extend(node.deps().iter().cloned());
    }

    let mut restricted = BuildGraph::new(ValidationMode::Deferred);
    for id in &keep {
        restricted.add_target(graph.must_node(id)?.target().clone())?;
    }
    restricted.validate()?;
    Ok(restricted)
}

/// Install the SIGINT handler: first signal drains gracefully.
pub fn install_cancel_handler(services: &Arc<BuildServices>) {
    // Signal handlers are process-global by OS contract; this is one of the
    // two sanctioned globals.
    let services = Arc::clone(services);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            services.request_shutdown();
        }
    });
}
