//! The scheduler: parallel dispatch of ready actions.
//!
//! Readiness is lock-free: each node carries a `pending_deps` counter, and
//! a completing dependency atomically decrements every dependent; the
//! decrement that reaches zero pushes the dependent onto the ready queue.
//! Ready nodes dispatch longest-critical-path first (FIFO within ties),
//! bounded by a concurrency cap.
//!
//! A terminal failure flips the scheduler into *drain* mode: nothing new
//! dispatches, in-flight actions are awaited, and all still-pending
//! transitive dependents of the failure are marked failed. The report
//! carries the first root cause.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    cache::ActionId,
    checkpoint::{CHECKPOINT_EVERY, CHECKPOINT_EVERY_COMPLETIONS, Checkpoint},
    error::{BuildError, ErrorKind},
    fs,
    graph::{BuildGraph, NodeStatus},
    handler::{ActionLookup, ActionRecorder, BuildContext, LanguageBuildResult, RecordedAction},
    hash::Blake3,
    incremental::RebuildPlan,
    retry::{BreakerConfig, ToolBreaker},
    services::BuildServices,
    target::TargetId,
};

/// Executes one action and reports the handler's result.
///
/// Implementations run locally (blocking thread pool) or remotely (through
/// the distributed coordinator); the scheduler does not care which.
pub trait ActionExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        ctx: BuildContext,
    ) -> impl Future<Output = Result<LanguageBuildResult>> + Send;
}

/// Scheduler tuning knobs.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// In-flight action cap. Defaults to the detected CPU count.
    pub concurrency: usize,
    /// Per-action timeout.
    pub action_timeout: Duration,
    /// Ready-queue length beyond which dispatch polling slows down; this is
    /// also the "queue full" signal that induces stealing in workers.
    pub backpressure_watermark: usize,
    /// Where to write periodic checkpoints; `None` disables them.
    pub checkpoint_path: Option<PathBuf>,
    /// Optional per-tool circuit breaker; `None` (the default) disables it.
    pub breaker: Option<BreakerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            action_timeout: Duration::from_secs(300),
            backpressure_watermark: 1024,
            checkpoint_path: None,
            breaker: None,
        }
    }
}

/// Outcome of one build invocation.
#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub built: usize,
    pub cached: usize,
    /// Targets that failed directly.
    pub failed: Vec<TargetId>,
    /// Targets failed by propagation from a failed dependency.
    pub propagated: Vec<TargetId>,
    /// The first root-cause failure, rendered.
    pub first_cause: Option<String>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.propagated.is_empty() && !self.cancelled
    }
}

/// Priority-queue item: deepest critical path first, FIFO within ties.
#[derive(Eq, PartialEq)]
struct ReadyItem {
    depth: u64,
    seq: Reverse<u64>,
    id: TargetId,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.depth, &self.seq).cmp(&(other.depth, &other.seq))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum Outcome {
    CacheHit(Blake3),
    Built(LanguageBuildResult),
    RetryQueued,
}

struct Completion {
    id: TargetId,
    outcome: Result<Outcome>,
}

/// The central control loop for local execution.
pub struct Scheduler<E> {
    services: Arc<BuildServices>,
    executor: Arc<E>,
    config: SchedulerConfig,
    breaker: Option<Arc<ToolBreaker>>,
}

impl<E: ActionExecutor> Scheduler<E> {
    pub fn new(services: Arc<BuildServices>, executor: Arc<E>, config: SchedulerConfig) -> Self {
        let breaker = config
            .breaker
            .map(|cfg| Arc::new(ToolBreaker::new(cfg.threshold, cfg.cooldown)));
        Self {
            services,
            executor,
            config,
            breaker,
        }
    }

    /// Run the graph to completion with no precomputed plan: every target
    /// decides freshness through the build cache alone.
    pub async fn run(&self, graph: Arc<BuildGraph>) -> Result<BuildReport> {
        self.run_planned(graph, None).await
    }

    /// Run the graph to completion (or drain on failure/cancel).
    ///
    /// With a rebuild plan, targets whose sources the planner marked
    /// affected skip the build-cache check outright (the plan has already
    /// seen through their dependency closures), and handlers receive the
    /// per-target verdict for file-level decisions.
    #[instrument(name = "Scheduler::run_planned", skip_all, fields(targets = graph.len(), planned = plan.is_some()))]
    pub async fn run_planned(
        &self,
        graph: Arc<BuildGraph>,
        plan: Option<RebuildPlan>,
    ) -> Result<BuildReport> {
        let plan = Arc::new(plan);
        let started = Instant::now();
        graph.reset_for_execution();

        let mut report = BuildReport::default();
        let mut ready: BinaryHeap<ReadyItem> = BinaryHeap::new();
        let mut seq = 0u64;

        // Seed: checkpoint-restored nodes already count as complete and must
        // release their dependents; everything else with no pending deps is
        // immediately ready.
        for node in graph.nodes() {
            if node.status().is_complete_ok() {
                report.cached += 1;
                for dependent in node.dependents() {
                    graph.must_node(dependent)?.resolve_dep();
                }
            }
        }
        for node in graph.nodes() {
            if node.status() == NodeStatus::Pending && node.pending_deps() == 0 {
                ready.push(ReadyItem {
                    depth: graph.depth(node.id()),
                    seq: Reverse(seq),
                    id: node.id().clone(),
                });
                seq += 1;
            }
        }

        let (tx, rx) = flume::unbounded::<Completion>();
        let mut in_flight = 0usize;
        let mut draining = false;
        let mut completions_since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        loop {
            if self.services.shutdown_requested() && !draining {
                info!("shutdown requested, draining in-flight actions");
                draining = true;
                report.cancelled = true;
            }

            while !draining && in_flight < self.config.concurrency {
                let Some(item) = ready.pop() else {
                    break;
                };
                let node = graph.must_node(&item.id)?;
                // CAS guards against double dispatch.
                if !node.try_start() {
                    continue;
                }
                self.dispatch(&graph, item.id, tx.clone(), &plan);
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            // Backpressure: a deep ready queue means dispatches outpace
            // completions, so poll slower instead of busy-looping.
            if ready.len() > self.config.backpressure_watermark {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            let completion = rx.recv_async().await.context("completion channel closed")?;
            in_flight -= 1;
            let language = graph.must_node(&completion.id)?.target().language.clone();

            match completion.outcome {
                Ok(Outcome::RetryQueued) => {
                    // The retry task re-delivers a completion later; the
                    // node went back to pending and is re-pushed now.
                    let node = graph.must_node(&completion.id)?;
                    if node.status() == NodeStatus::Pending && !draining {
                        ready.push(ReadyItem {
                            depth: graph.depth(&completion.id),
                            seq: Reverse(seq),
                            id: completion.id,
                        });
                        seq += 1;
                    }
                    continue;
                }
                Ok(Outcome::CacheHit(hash)) => {
                    let node = graph.must_node(&completion.id)?;
                    node.set_output_hash(hash);
                    node.set_status(NodeStatus::Cached);
                    report.cached += 1;
                    trace!(id = %completion.id, "cache hit");
                    self.notify_dependents(&graph, &completion.id, &mut ready, &mut seq, draining)?;
                }
                Ok(Outcome::Built(result)) if result.success => {
                    let node = graph.must_node(&completion.id)?;
                    let output_hash = result.output_hash.clone().unwrap_or_else(|| {
                        Blake3::from_buffer(completion.id.to_string())
                    });

                    // Cache update happens before the status flip: dependents
                    // only observe Success after the entry is readable.
                    let sources = self.absolute_sources(&graph, &completion.id)?;
                    let deps = self.dep_hashes(&graph, &completion.id)?;
                    self.services
                        .build_cache
                        .update(&completion.id, &sources, &deps, output_hash.clone())
                        .await
                        .context("record build in cache")?;

                    node.set_output_hash(output_hash);
                    node.set_status(NodeStatus::Success);
                    report.built += 1;
                    self.record_tool(&language, true);
                    debug!(id = %completion.id, "built");
                    self.notify_dependents(&graph, &completion.id, &mut ready, &mut seq, draining)?;
                }
                Ok(Outcome::Built(result)) => {
                    // The handler ran and the tool rejected the input: a
                    // compile failure, never retried.
                    self.record_tool(&language, false);
                    let cause = BuildError::new(
                        ErrorKind::CompilationFailed,
                        result.error.unwrap_or_else(|| "build failed".to_string()),
                    );
                    self.fail_node(&graph, &completion.id, cause.into(), &mut report, &mut draining);
                }
                Err(err) => {
                    self.record_tool(&language, false);
                    let node = graph.must_node(&completion.id)?;
                    let class = BuildError::classify(&err);
                    let attempt = node.bump_retry();
                    match self.services.retries.decide(class, attempt) {
                        Some(delay) if !draining => {
                            warn!(id = %completion.id, %class, attempt, ?delay, "action failed, retrying");
                            node.set_status(NodeStatus::Pending);
                            let tx = tx.clone();
                            let id = completion.id.clone();
                            in_flight += 1;
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send_async(Completion {
                                    id,
                                    outcome: Ok(Outcome::RetryQueued),
                                })
                                .await;
                            });
                        }
                        _ => {
                            self.fail_node(&graph, &completion.id, err, &mut report, &mut draining);
                        }
                    }
                }
            }

            completions_since_checkpoint += 1;
            if self.should_checkpoint(completions_since_checkpoint, last_checkpoint) {
                self.write_checkpoint(&graph).await;
                completions_since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }

        report.duration = started.elapsed();
        self.finish(&graph, &report).await?;

        info!(
            built = report.built,
            cached = report.cached,
            failed = report.failed.len(),
            propagated = report.propagated.len(),
            cancelled = report.cancelled,
            "build finished",
        );
        Ok(report)
    }

    /// Spawn the cache check + execution for one node.
    fn dispatch(
        &self,
        graph: &Arc<BuildGraph>,
        id: TargetId,
        tx: flume::Sender<Completion>,
        plan: &Arc<Option<RebuildPlan>>,
    ) {
        let services = Arc::clone(&self.services);
        let executor = Arc::clone(&self.executor);
        let graph = Arc::clone(graph);
        let plan = Arc::clone(plan);
        let breaker = self.breaker.clone();
        let timeout = self.config.action_timeout;

        tokio::spawn(async move {
            let outcome = execute_one(
                &services,
                executor.as_ref(),
                &graph,
                &id,
                timeout,
                &plan,
                breaker.as_deref(),
            )
            .await;
            let _ = tx.send_async(Completion { id, outcome }).await;
        });
    }

    fn record_tool(&self, language: &str, success: bool) {
        if let Some(breaker) = &self.breaker {
            breaker.record(language, success);
        }
    }

    fn notify_dependents(
        &self,
        graph: &Arc<BuildGraph>,
        id: &TargetId,
        ready: &mut BinaryHeap<ReadyItem>,
        seq: &mut u64,
        draining: bool,
    ) -> Result<()> {
        let node = graph.must_node(id)?;
        for dependent in node.dependents() {
            let dependent_node = graph.must_node(dependent)?;
            if dependent_node.resolve_dep() && !draining {
                ready.push(ReadyItem {
                    depth: graph.depth(dependent),
                    seq: Reverse(*seq),
                    id: dependent.clone(),
                });
                *seq += 1;
            }
        }
        Ok(())
    }

    /// Terminal failure: mark the node, remember the first cause, flip to
    /// drain mode, and fail all still-pending transitive dependents.
    fn fail_node(
        &self,
        graph: &Arc<BuildGraph>,
        id: &TargetId,
        cause: color_eyre::Report,
        report: &mut BuildReport,
        draining: &mut bool,
    ) {
        error!(%id, %cause, "target failed");
        if let Some(node) = graph.node(id) {
            node.set_status(NodeStatus::Failed);
        }
        report.failed.push(id.clone());
        if report.first_cause.is_none() {
            report.first_cause = Some(format!("{id}: {cause:#}"));
        }
        *draining = true;

        for dependent in graph.transitive_dependents(id) {
            if let Some(node) = graph.node(&dependent)
                && node.transition(NodeStatus::Pending, NodeStatus::Failed)
            {
                report.propagated.push(dependent);
            }
        }
    }

    fn should_checkpoint(&self, completions: usize, last: Instant) -> bool {
        self.config.checkpoint_path.is_some()
            && (completions >= CHECKPOINT_EVERY_COMPLETIONS || last.elapsed() >= CHECKPOINT_EVERY)
    }

    async fn write_checkpoint(&self, graph: &BuildGraph) {
        let Some(path) = &self.config.checkpoint_path else {
            return;
        };
        let checkpoint = Checkpoint::capture(graph, &self.services.workspace);
        if let Err(err) = checkpoint.write(path, &self.services.key).await {
            warn!(?path, ?err, "checkpoint write failed");
        }
    }

    /// Final bookkeeping: flush caches, and either clear the checkpoint
    /// after a clean full build or persist the partial state for resume.
    async fn finish(&self, graph: &BuildGraph, report: &BuildReport) -> Result<()> {
        if let Some(path) = &self.config.checkpoint_path {
            if report.success() {
                Checkpoint::clear(path).await?;
            } else {
                let checkpoint = Checkpoint::capture(graph, &self.services.workspace);
                checkpoint.write(path, &self.services.key).await?;
            }
        }
        self.services.flush_all().await
    }

    fn absolute_sources(&self, graph: &BuildGraph, id: &TargetId) -> Result<Vec<PathBuf>> {
        let node = graph.must_node(id)?;
        Ok(absolutize(&self.services.workspace, &node.target().sources))
    }

    fn dep_hashes(&self, graph: &BuildGraph, id: &TargetId) -> Result<Vec<(TargetId, Blake3)>> {
        let node = graph.must_node(id)?;
        node.deps()
            .iter()
            .map(|dep| {
                let hash = graph.must_node(dep)?.output_hash().ok_or_else(|| {
                    BuildError::new(
                        ErrorKind::BuildFailed,
                        format!("dependency {dep} completed without an output hash"),
                    )
                })?;
                Ok((dep.clone(), hash))
            })
            .collect()
    }
}

/// Cache check then execution for one node, off the dispatch loop.
async fn execute_one<E: ActionExecutor>(
    services: &Arc<BuildServices>,
    executor: &E,
    graph: &Arc<BuildGraph>,
    id: &TargetId,
    timeout: Duration,
    plan: &Option<RebuildPlan>,
    breaker: Option<&ToolBreaker>,
) -> Result<Outcome> {
    let node = graph.must_node(id)?;
    let target = node.target().clone();
    let sources = absolutize(&services.workspace, &target.sources);

    let deps: Vec<(TargetId, Blake3)> = node
        .deps()
        .iter()
        .filter_map(|dep| {
            let hash = graph.node(dep).and_then(|n| n.output_hash())?;
            Some((dep.clone(), hash))
        })
        .collect();

    // The planner's verdict for this target: which of its declared sources
    // sit on a changed dependency closure.
    let affected: Option<BTreeSet<PathBuf>> = plan.as_ref().map(|plan| {
        target
            .sources
            .iter()
            .filter(|source| {
                let absolute = if source.is_absolute() {
                    (*source).clone()
                } else {
                    services.workspace.join(source)
                };
                plan.affected.contains(&absolute)
            })
            .cloned()
            .collect()
    });
    let planner_saw_changes = affected.as_ref().is_some_and(|affected| !affected.is_empty());

    // A plan that marked sources affected has seen through the dependency
    // closure (headers included), so the build-cache check is skipped; it
    // only compares declared sources and dependency outputs.
    if !planner_saw_changes
        && services.build_cache.is_cached(id, &sources, &deps).await?
        && let Some(hash) = services.build_cache.recorded_output(id)
    {
        return Ok(Outcome::CacheHit(hash));
    }

    // An open breaker sheds alternating requests for the failing tool;
    // shed calls wait out a short pause instead of failing, halving
    // throughput on that tool for the cooldown.
    if let Some(breaker) = breaker {
        while !breaker.allow(&target.language) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    let scratch = services.layout.scratch().join(Uuid::new_v4().to_string());
    fs::create_dir_all(&scratch).await?;

    let recorder: ActionRecorder = {
        let services = Arc::clone(services);
        Arc::new(move |recorded: RecordedAction| {
            services.action_cache.update(
                recorded.id,
                recorded.inputs,
                recorded.outputs,
                recorded.metadata,
                recorded.success,
            );
        })
    };

    let lookup: ActionLookup = {
        let services = Arc::clone(services);
        Arc::new(move |id: &ActionId, inputs: &BTreeMap<PathBuf, Blake3>| {
            if services.action_cache.is_cached(id, inputs) {
                services.action_cache.get(id)
            } else {
                None
            }
        })
    };

    let ctx = BuildContext {
        env: target.env.clone(),
        target,
        workspace: services.workspace.clone(),
        scratch: scratch.clone(),
        timeout,
        recorder,
        lookup,
        affected,
    };

    let result = executor.execute(ctx).await;

    // Scratch is per-action; always reclaimed.
    if let Err(err) = fs::remove_dir_all_idempotent(&scratch).await {
        warn!(?scratch, ?err, "failed to clean scratch directory");
    }

    result.map(Outcome::Built)
}

fn absolutize(workspace: &std::path::Path, sources: &[PathBuf]) -> Vec<PathBuf> {
    sources
        .iter()
        .map(|source| {
            if source.is_absolute() {
                source.clone()
            } else {
                workspace.join(source)
            }
        })
        .collect()
}

/// Executes actions in-process: handler on the blocking pool, outputs into
/// the CAS.
pub struct LocalExecutor {
    services: Arc<BuildServices>,
}

impl LocalExecutor {
    pub fn new(services: Arc<BuildServices>) -> Self {
        Self { services }
    }
}

impl ActionExecutor for LocalExecutor {
    #[instrument(name = "LocalExecutor::execute", skip_all, fields(target = %ctx.target.id))]
    async fn execute(&self, ctx: BuildContext) -> Result<LanguageBuildResult> {
        let handler = self.services.handlers.get(&ctx.target.language)?;

        // Handlers are blocking by contract; the pool is sized to the
        // concurrency cap so waits never starve the dispatch loop.
        let timeout = ctx.timeout;
        let task = tokio::task::spawn_blocking(move || handler.build(&ctx));
        let result = match tokio::time::timeout(timeout + Duration::from_secs(1), task).await {
            Ok(joined) => joined.context("join handler")??,
            Err(_) => {
                return Err(BuildError::new(
                    ErrorKind::BuildTimeout,
                    format!("handler exceeded {timeout:?}"),
                )
                .into());
            }
        };

        if result.success {
            // Invariant: every output of a successful action lands in the
            // CAS before the action is reported complete.
            futures::future::try_join_all(result.outputs.iter().map(|output| {
                let path = if output.is_absolute() {
                    output.clone()
                } else {
                    self.services.workspace.join(output)
                };
                async move {
                    let bytes = fs::must_read(&path).await.context("read declared output")?;
                    self.services.cas.put_blob(&bytes).await
                }
            }))
            .await?;
        }

        Ok(result)
    }
}
