//! The dependency-analyzer seam.
//!
//! Language-specific import scanners live outside the engine; they feed a
//! uniform dependency interface into the graph builder and the dependency
//! cache. The engine only ever calls through [`DependencyAnalyzer`],
//! resolved per language tag from the [`AnalyzerRegistry`].

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use tracing::{instrument, trace, warn};

use crate::cache::DepCache;

/// Scans one source file for its direct dependencies.
///
/// Implementations are blocking; the engine invokes them from blocking
/// contexts. They should resolve imports against `search_paths` and return
/// resolved file paths.
pub trait DependencyAnalyzer: Send + Sync {
    /// The language tag this analyzer serves.
    fn language(&self) -> &str;

    /// The direct dependencies of `source`.
    fn analyze(&self, source: &Path, search_paths: &[PathBuf]) -> Result<Vec<PathBuf>>;

    /// Whether `name` refers to an external (third-party) dependency that
    /// the engine should not track as a file.
    fn is_external(&self, name: &str) -> bool;
}

/// Maps language tags to analyzer implementations.
///
/// Analyzers are optional: a language without one simply plans its sources
/// conservatively.
#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: DashMap<String, Arc<dyn DependencyAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an analyzer under its language tag. Later registrations
    /// for the same tag win.
    #[instrument(name = "AnalyzerRegistry::register", skip_all, fields(language = analyzer.language()))]
    pub fn register(&self, analyzer: Arc<dyn DependencyAnalyzer>) {
        let language = analyzer.language().to_string();
        if self.analyzers.insert(language.clone(), analyzer).is_some() {
            warn!(%language, "replaced existing analyzer");
        }
    }

    /// The analyzer for a language tag, if one is registered.
    pub fn get(&self, language: &str) -> Option<Arc<dyn DependencyAnalyzer>> {
        self.analyzers.get(language).map(|a| a.value().clone())
    }

    pub fn languages(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.analyzers.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

/// Generic import scanner for quoted include/import directives.
///
/// Dedicated language analyzers plug in from outside the engine; this
/// adapter resolves `#include "path"` and `import "path"` lines against the
/// including file's directory and the search paths, so the dependency
/// cache stays warm for languages without a dedicated scanner.
#[derive(Debug)]
pub struct IncludeScanner {
    language: String,
}

impl IncludeScanner {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl DependencyAnalyzer for IncludeScanner {
    fn language(&self) -> &str {
        &self.language
    }

    #[instrument(name = "IncludeScanner::analyze", skip(self, search_paths))]
    fn analyze(&self, source: &Path, search_paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let bytes = std::fs::read(source).with_context(|| format!("read {source:?}"))?;
        let content = String::from_utf8_lossy(&bytes);

        let mut deps = Vec::new();
        for line in content.lines() {
            let line = line.trim_start();
            let Some(rest) = line
                .strip_prefix("#include \"")
                .or_else(|| line.strip_prefix("import \""))
            else {
                continue;
            };
            let Some((name, _)) = rest.split_once('"') else {
                continue;
            };
            if self.is_external(name) {
                continue;
            }

            // The including file's directory wins, then the search paths.
            let bases = source
                .parent()
                .map(Path::to_path_buf)
                .into_iter()
                .chain(search_paths.iter().cloned());
            for base in bases {
                let candidate = base.join(name);
                if candidate.exists() {
                    deps.push(candidate);
                    break;
                }
            }
        }

        trace!(?source, deps = deps.len(), "scanned imports");
        Ok(deps)
    }

    fn is_external(&self, name: &str) -> bool {
        // Angle includes resolve outside the tree.
        name.is_empty() || name.starts_with('<')
    }
}

/// Analyze a batch of sources and record results into the dependency cache.
///
/// Returns the union of all direct dependencies discovered.
#[instrument(skip_all, fields(language = analyzer.language(), sources = sources.len()))]
pub fn refresh_dep_cache(
    analyzer: &dyn DependencyAnalyzer,
    cache: &DepCache,
    sources: &[PathBuf],
    search_paths: &[PathBuf],
) -> Result<BTreeSet<PathBuf>> {
    let mut discovered = BTreeSet::new();
    for source in sources {
        let deps = analyzer.analyze(source, search_paths)?;
        discovered.extend(deps.iter().cloned());
        cache.record(source.clone(), deps);
    }
    Ok(discovered)
}
