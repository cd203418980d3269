//! Scheduler-side bridge into the distributed layer.
//!
//! In distributed mode the scheduler's dispatch lands here instead of on
//! the local blocking pool: sources are staged into the CAS, an action
//! request goes onto the coordinator's queue, and the executor waits for
//! whichever worker picks it up (or steals it) to report back.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{ActionId, ActionKind},
    error::{BuildError, ErrorKind},
    fs,
    handler::{BuildContext, LanguageBuildResult},
    hash::Blake3,
    scheduler::ActionExecutor,
    services::BuildServices,
    target::TargetKind,
};

use super::{
    coordinator::Coordinator,
    proto::{ActionRequest, ActionResult},
};

/// Routes coordinator results to the executor call awaiting each action.
#[derive(Debug)]
pub struct ResultRouter {
    waiters: DashMap<ActionId, flume::Sender<ActionResult>>,
}

impl ResultRouter {
    /// Spawn the routing task over the coordinator's result stream.
    pub fn spawn(results: flume::Receiver<ActionResult>) -> Arc<Self> {
        let router = Arc::new(Self {
            waiters: DashMap::new(),
        });
        let task_router = Arc::clone(&router);
        tokio::spawn(async move {
            while let Ok(result) = results.recv_async().await {
                match task_router.waiters.remove(&result.action) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(result);
                    }
                    None => warn!(action = %result.action, "result with no waiter"),
                }
            }
        });
        router
    }

    fn subscribe(&self, action: ActionId) -> flume::Receiver<ActionResult> {
        let (tx, rx) = flume::bounded(1);
        self.waiters.insert(action, tx);
        rx
    }

    fn unsubscribe(&self, action: &ActionId) {
        self.waiters.remove(action);
    }
}

/// [`ActionExecutor`] that hands actions to the coordinator.
pub struct DistributedExecutor {
    services: Arc<BuildServices>,
    coordinator: Arc<Coordinator>,
    router: Arc<ResultRouter>,
}

impl DistributedExecutor {
    pub fn new(
        services: Arc<BuildServices>,
        coordinator: Arc<Coordinator>,
        router: Arc<ResultRouter>,
    ) -> Self {
        Self {
            services,
            coordinator,
            router,
        }
    }

    /// Stage sources into the CAS and build the wire request.
    async fn prepare(&self, ctx: &BuildContext) -> Result<ActionRequest> {
        let Some(command) = ctx.target.config.get("command") else {
            return Err(BuildError::new(
                ErrorKind::HandlerNotFound,
                format!("target {} declares no command", ctx.target.id),
            )
            .suggest("set `command` in the target's config map")
            .into());
        };
        let command: Vec<String> = command.split_whitespace().map(String::from).collect();

        let mut inputs = Vec::new();
        let mut input_hashes = Vec::new();
        for source in &ctx.target.sources {
            let absolute = if source.is_absolute() {
                source.clone()
            } else {
                ctx.workspace.join(source)
            };
            let bytes = fs::must_read(&absolute)
                .await
                .context("stage source into cas")?;
            let hash = self.services.cas.put_blob(&bytes).await?;
            input_hashes.push(hash.clone());
            inputs.push((hash, source.clone()));
        }

        let kind = match ctx.target.kind {
            TargetKind::Library => ActionKind::Compile,
            TargetKind::Executable => ActionKind::Link,
            TargetKind::Test => ActionKind::Test,
            TargetKind::Custom => ActionKind::Custom,
        };

        Ok(ActionRequest {
            action: ActionId {
                target: ctx.target.id.clone(),
                kind,
                sub_id: String::new(),
                input_hash: Blake3::from_fields(input_hashes.iter()),
            },
            language: ctx.target.language.clone(),
            command,
            inputs,
            env: ctx.env.clone(),
            timeout: ctx.timeout,
            priority: 0,
        })
    }

    /// Pull a worker's outputs out of the CAS into the workspace.
    async fn materialize(&self, result: &ActionResult, ctx: &BuildContext) -> Result<Vec<Blake3>> {
        let mut hashes = Vec::new();
        for (path, hash) in &result.outputs {
            let bytes = self.services.cas.must_get_blob(hash).await.map_err(|err| {
                BuildError::new(
                    ErrorKind::ArtifactTransferFailed,
                    format!("fetch output {path:?}: {err:#}"),
                )
            })?;
            fs::write_atomic(&ctx.workspace.join(path), &bytes).await?;
            hashes.push(hash.clone());
        }
        hashes.sort();
        Ok(hashes)
    }
}

impl ActionExecutor for DistributedExecutor {
    #[instrument(name = "DistributedExecutor::execute", skip_all, fields(target = %ctx.target.id))]
    async fn execute(&self, ctx: BuildContext) -> Result<LanguageBuildResult> {
        let request = self.prepare(&ctx).await?;
        let action = request.action.clone();
        let deadline = request.timeout * 2;

        let waiter = self.router.subscribe(action.clone());
        self.coordinator.submit(request);

        let result = match tokio::time::timeout(deadline, waiter.recv_async()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.router.unsubscribe(&action);
                return Err(BuildError::new(
                    ErrorKind::CoordinatorUnreachable,
                    "result channel closed",
                )
                .into());
            }
            Err(_) => {
                self.router.unsubscribe(&action);
                // The coordinator's sweep will requeue the assignment; the
                // scheduler's retry layer decides whether we wait again.
                return Err(BuildError::new(
                    ErrorKind::WorkerTimeout,
                    format!("no worker completed {action} within {deadline:?}"),
                )
                .into());
            }
        };

        if !result.success {
            debug!(exit_code = result.exit_code, "remote action failed");
            return Ok(LanguageBuildResult::failed(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }

        let output_hashes = self.materialize(&result, &ctx).await?;
        let outputs = result.outputs.iter().map(|(path, _)| path.clone()).collect();
        Ok(LanguageBuildResult {
            success: true,
            error: None,
            output_hash: Some(Blake3::from_fields(output_hashes.iter())),
            outputs,
        })
    }
}
