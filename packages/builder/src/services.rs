//! Explicit wiring of engine services.
//!
//! Earlier designs leaned on process-wide singletons for shutdown, retry,
//! and cache handles. Here everything is carried by a [`BuildServices`]
//! value passed to the scheduler and executors. The only process-global
//! pieces are OS signal handlers (installed by the binary) and compile-time
//! registries, both by necessity.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    analyzer::AnalyzerRegistry,
    cache::{ActionCache, BuildCache, DepCache, GraphCache},
    cas::FsCas,
    config::{CacheConfig, CacheLayout},
    fs,
    handler::HandlerRegistry,
    integrity::WorkspaceKey,
    retry::RetryPolicies,
};

/// Shared context for one engine invocation.
#[derive(Debug)]
pub struct BuildServices {
    pub workspace: PathBuf,
    pub config: CacheConfig,
    pub layout: CacheLayout,
    pub key: WorkspaceKey,
    pub build_cache: BuildCache,
    pub action_cache: ActionCache,
    pub dep_cache: DepCache,
    pub graph_cache: GraphCache,
    pub cas: FsCas,
    pub handlers: HandlerRegistry,
    pub analyzers: AnalyzerRegistry,
    pub retries: RetryPolicies,
    shutdown: AtomicBool,
}

impl BuildServices {
    /// Open every cache and the CAS for the given workspace.
    #[instrument(name = "BuildServices::initialize", skip(config))]
    pub async fn initialize(workspace: &Path, config: CacheConfig) -> Result<Arc<Self>> {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("canonicalize workspace {workspace:?}"))?;
        let layout = CacheLayout::new(&config, &workspace);
        fs::create_dir_all(&layout.root).await?;

        // The key is derived from the absolute workspace path, scoping every
        // signed cache file to this workspace.
        let key = WorkspaceKey::derive(&workspace);

        let build_cache =
            BuildCache::load(layout.build_cache(), key.clone(), config.clone()).await;
        let action_cache = ActionCache::load(layout.action_cache(), key.clone(), &config).await;
        let dep_cache = DepCache::load(layout.dep_cache(), key.clone(), &config).await;
        let graph_cache = GraphCache::new(layout.graph_cache(), key.clone(), &config);
        let cas = FsCas::open(layout.cas()).await?;

        debug!(?workspace, "services initialized");
        Ok(Arc::new(Self {
            workspace,
            config,
            layout,
            key,
            build_cache,
            action_cache,
            dep_cache,
            graph_cache,
            cas,
            handlers: HandlerRegistry::new(),
            analyzers: AnalyzerRegistry::new(),
            retries: RetryPolicies::default(),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Request a graceful shutdown: the scheduler stops dispatching, awaits
    /// in-flight work, checkpoints, and exits.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flush every dirty cache. Called once at the end of a build.
    #[instrument(name = "BuildServices::flush_all", skip(self))]
    pub async fn flush_all(&self) -> Result<()> {
        self.build_cache.flush(true).await.context("flush build cache")?;
        self.action_cache.flush().await.context("flush action cache")?;
        self.dep_cache.flush().await.context("flush dep cache")?;
        Ok(())
    }
}
