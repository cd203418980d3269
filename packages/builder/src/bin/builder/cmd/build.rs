//! Builds targets with caching, incrementality, and parallel dispatch.

use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::{info, instrument, warn};

use builder::{
    incremental::{self, RebuildStrategy},
    manifest::Manifest,
    retry::BreakerConfig,
    scheduler::{BuildReport, LocalExecutor, Scheduler, SchedulerConfig},
};

use crate::cmd;

/// Options for `build`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Target to build; everything when omitted
    target: Option<String>,

    /// Maximum concurrent actions (default: CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Rebuild strategy for change detection
    #[arg(long, value_enum, default_value_t = RebuildStrategy::Incremental)]
    strategy: RebuildStrategy,

    /// Open a circuit breaker on tools that fail repeatedly
    #[arg(long)]
    breaker: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<i32> {
    let workspace = cmd::workspace_root()?;
    let manifest = Manifest::load(&workspace).await?;

    let root = options
        .target
        .as_deref()
        .map(|reference| manifest.resolve(reference))
        .transpose()?;

    let services = cmd::open_services(&manifest).await?;
    cmd::install_cancel_handler(&services);

    let graph = cmd::load_graph(&services, manifest).await?;
    let graph = match &root {
        Some(root) => cmd::subgraph(&graph, root)?,
        None => graph,
    };
    info!(targets = graph.len(), "build starting");

    // Change detection + dependency analysis before any dispatch: the plan
    // decides which sources' actions can be reused.
    let plan = incremental::plan_for_graph(&services, &graph, options.strategy).await?;
    info!(
        strategy = %options.strategy,
        affected = plan.affected.len(),
        reusable = plan.reusable.len(),
        "rebuild plan",
    );

    let mut config = SchedulerConfig {
        checkpoint_path: Some(services.layout.checkpoint()),
        breaker: options.breaker.then(BreakerConfig::default),
        ..SchedulerConfig::default()
    };
    if let Some(jobs) = options.jobs {
        config.concurrency = jobs.max(1);
    }

    let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
    let scheduler = Scheduler::new(Arc::clone(&services), executor, config);
    let report = scheduler.run_planned(Arc::new(graph), Some(plan)).await?;

    render_report(&report);
    Ok(if report.success() { 0 } else { 1 })
}

pub fn render_report(report: &BuildReport) {
    info!(
        built = report.built,
        cached = report.cached,
        duration = ?report.duration,
        "build summary",
    );
    if report.cancelled {
        warn!("build cancelled; partial state checkpointed for `builder resume`");
    }
    for target in &report.failed {
        warn!(%target, "failed");
    }
    for target in &report.propagated {
        warn!(%target, "not built: a dependency failed");
    }
    if let Some(cause) = &report.first_cause {
        // The first root cause, with the failing tool's output verbatim.
        eprintln!("\nbuild failed: {cause}");
    }
}
