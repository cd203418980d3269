//! Resumes an interrupted build from its checkpoint.

use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::{info, instrument, warn};

use builder::{
    checkpoint::Checkpoint,
    error::{BuildError, ErrorKind},
    manifest::Manifest,
    scheduler::{LocalExecutor, Scheduler, SchedulerConfig},
};

use crate::cmd;

/// Options for `resume`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Proceed even if the checkpoint is older than 24 hours
    #[arg(long)]
    stale_ok: bool,

    /// Maximum concurrent actions (default: CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,
}

#[instrument]
pub async fn exec(options: Options) -> Result<i32> {
    let workspace = cmd::workspace_root()?;
    let manifest = Manifest::load(&workspace).await?;
    let services = cmd::open_services(&manifest).await?;
    cmd::install_cancel_handler(&services);

    let checkpoint_path = services.layout.checkpoint();
    let Some(checkpoint) = Checkpoint::load(&checkpoint_path, &services.key).await else {
        return Err(BuildError::new(
            ErrorKind::CacheLoadFailed,
            "no checkpoint to resume from",
        )
        .suggest("run `builder build` to start a fresh build")
        .into());
    };

    if checkpoint.is_stale() && !options.stale_ok {
        return Err(BuildError::new(
            ErrorKind::CacheLoadFailed,
            "checkpoint is older than 24 hours",
        )
        .suggest("pass --stale-ok to resume anyway, or `builder build` to start fresh")
        .into());
    }

    // Rebuild the graph from current sources and make sure the snapshot
    // still describes it.
    let graph = cmd::load_graph(&services, manifest).await?;
    checkpoint.validate_against(&graph)?;
    let restored = checkpoint.merge_into(&graph);
    info!(
        restored,
        failed = checkpoint.failed_targets.len(),
        "resuming build",
    );
    for target in &checkpoint.failed_targets {
        warn!(%target, "retrying previously failed target");
    }

    let mut config = SchedulerConfig {
        checkpoint_path: Some(checkpoint_path),
        ..SchedulerConfig::default()
    };
    if let Some(jobs) = options.jobs {
        config.concurrency = jobs.max(1);
    }

    let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
    let scheduler = Scheduler::new(Arc::clone(&services), executor, config);
    let report = scheduler.run(Arc::new(graph)).await?;

    super::build::render_report(&report);
    Ok(if report.success() { 0 } else { 1 })
}
