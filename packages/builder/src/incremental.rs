//! The incremental-rebuild engine.
//!
//! Given the full source set and the set of changed files, computes the
//! minimal set of file-level actions that must rerun. A source is *affected*
//! when it, or any file in its transitive dependency closure, changed.
//! Everything else is satisfied from the action cache.
//!
//! Planning is deterministic: the same sources, changed set, and dependency
//! cache state always produce the same plan.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use tracing::{debug, instrument};

use crate::{analyzer::refresh_dep_cache, cache::DepCache, graph::BuildGraph, services::BuildServices};

/// How aggressively to reuse prior work.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Display, clap::ValueEnum)]
pub enum RebuildStrategy {
    /// Recompile everything regardless of what changed.
    #[display("full")]
    Full,
    /// Recompile the affected set: changed files plus everything that
    /// transitively reaches them.
    #[default]
    #[display("incremental")]
    Incremental,
    /// Recompile only sources that changed directly.
    #[display("minimal")]
    Minimal,
}

/// The outcome of planning: which sources rerun and which are reusable.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct RebuildPlan {
    /// Sources whose actions must execute.
    pub affected: BTreeSet<PathBuf>,
    /// Sources satisfiable from the action cache.
    pub reusable: BTreeSet<PathBuf>,
}

impl RebuildPlan {
    pub fn is_full_rebuild(&self) -> bool {
        self.reusable.is_empty() && !self.affected.is_empty()
    }
}

/// Computes rebuild plans from the dependency cache.
#[derive(Debug)]
pub struct RebuildPlanner<'a> {
    deps: &'a DepCache,
    strategy: RebuildStrategy,
}

impl<'a> RebuildPlanner<'a> {
    pub fn new(deps: &'a DepCache, strategy: RebuildStrategy) -> Self {
        Self { deps, strategy }
    }

    /// Partition `sources` into affected and reusable sets.
    #[instrument(name = "RebuildPlanner::plan", skip_all, fields(strategy = %self.strategy, sources = sources.len(), changed = changed.len()))]
    pub fn plan(&self, sources: &[PathBuf], changed: &BTreeSet<PathBuf>) -> RebuildPlan {
        let mut plan = RebuildPlan::default();

        for source in sources {
            if self.is_affected(source, changed) {
                plan.affected.insert(source.clone());
            } else {
                plan.reusable.insert(source.clone());
            }
        }

        debug!(
            affected = plan.affected.len(),
            reusable = plan.reusable.len(),
            "rebuild plan computed",
        );
        plan
    }

    fn is_affected(&self, source: &Path, changed: &BTreeSet<PathBuf>) -> bool {
        match self.strategy {
            RebuildStrategy::Full => true,
            RebuildStrategy::Minimal => changed.contains(source),
            RebuildStrategy::Incremental => {
                if changed.contains(source) {
                    return true;
                }
                // A source with no dependency record is conservatively
                // affected: the analyzer has not seen it yet.
                let Some(direct) = self.deps.direct(source) else {
                    return true;
                };
                if direct.iter().any(|dep| changed.contains(dep)) {
                    return true;
                }
                self.deps
                    .closure(source)
                    .iter()
                    .any(|dep| changed.contains(dep))
            }
        }
    }
}

/// Plan a build over every source the graph declares.
///
/// Change detection runs against the dependency cache's recorded
/// fingerprints (metadata fast path first, headers and other reachable
/// files included), then sources whose content moved or that were never
/// analyzed are re-scanned so the dependency edges stay current. Files
/// never seen before are conservatively changed.
#[instrument(name = "incremental::plan_for_graph", skip_all, fields(%strategy, targets = graph.len()))]
pub async fn plan_for_graph(
    services: &Arc<BuildServices>,
    graph: &BuildGraph,
    strategy: RebuildStrategy,
) -> Result<RebuildPlan> {
    let mut by_language: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut sources: BTreeSet<PathBuf> = BTreeSet::new();
    for node in graph.nodes() {
        for source in &node.target().sources {
            let absolute = if source.is_absolute() {
                source.clone()
            } else {
                services.workspace.join(source)
            };
            by_language
                .entry(node.target().language.clone())
                .or_default()
                .push(absolute.clone());
            sources.insert(absolute);
        }
    }

    // Everything reachable through the recorded dependency edges is part
    // of the change scan, headers included.
    let mut scan = sources.clone();
    for source in &sources {
        scan.extend(services.dep_cache.closure(source));
    }

    let changed = {
        let services = Arc::clone(services);
        let scan = scan.clone();
        tokio::task::spawn_blocking(move || {
            scan.into_iter()
                .filter(|file| services.dep_cache.check_changed(file))
                .collect::<BTreeSet<PathBuf>>()
        })
        .await
        .context("join change detection")?
    };

    // Re-analyze sources whose content moved (or that were never seen) so
    // the dependency cache tracks their current imports.
    for (language, language_sources) in by_language {
        let Some(analyzer) = services.analyzers.get(&language) else {
            continue;
        };
        let stale: Vec<PathBuf> = language_sources
            .into_iter()
            .filter(|source| {
                changed.contains(source) || services.dep_cache.direct(source).is_none()
            })
            .collect();
        if stale.is_empty() {
            continue;
        }
        let analyzed = stale.len();

        let services_bg = Arc::clone(services);
        let scan_bg = scan.clone();
        let discovered = tokio::task::spawn_blocking(move || {
            let search_paths = vec![services_bg.workspace.clone()];
            let discovered = refresh_dep_cache(
                analyzer.as_ref(),
                &services_bg.dep_cache,
                &stale,
                &search_paths,
            )?;
            // Newly discovered files get a fingerprint now, so the next
            // plan sees them as unchanged rather than unknown.
            for file in &discovered {
                if !scan_bg.contains(file) {
                    services_bg.dep_cache.check_changed(file);
                }
            }
            Ok::<_, color_eyre::Report>(discovered)
        })
        .await
        .context("join dependency analysis")??;
        debug!(%language, analyzed, discovered = discovered.len(), "dependency edges refreshed");
    }

    let sources: Vec<PathBuf> = sources.into_iter().collect();
    let planner = RebuildPlanner::new(&services.dep_cache, strategy);
    Ok(planner.plan(&sources, &changed))
}
