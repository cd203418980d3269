//! The language-handler seam.
//!
//! Per-language compiler wrappers (rustc, javac, tsc, ...) live outside the
//! engine. To the engine a handler is a black-box function
//! `(target, inputs, env) -> (outputs, exit_code, stdout, stderr)`, modeled
//! by [`LanguageHandler`]. Handlers vary only in their `build` behavior; a
//! registry maps language tag to implementation.
//!
//! Handlers are blocking by contract. The scheduler invokes them on the
//! blocking thread pool, sized to the concurrency cap, so subprocess waits
//! never stall the dispatch loop.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::Result;
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{ActionId, ActionKind, ActionOutput, ActionRecord},
    error::{BuildError, ErrorKind},
    hash::{self, Blake3},
    target::{Target, TargetKind},
};

/// A fully recorded action execution, fed back into the action cache.
#[derive(Clone, Debug)]
pub struct RecordedAction {
    pub id: ActionId,
    pub inputs: BTreeMap<PathBuf, Blake3>,
    pub outputs: Vec<ActionOutput>,
    pub metadata: BTreeMap<String, String>,
    pub success: bool,
}

/// Callback through which handlers populate the action cache.
pub type ActionRecorder = Arc<dyn Fn(RecordedAction) + Send + Sync>;

/// Callback through which handlers consult the action cache.
///
/// Returns the recorded execution when the cache holds an entry for the
/// action whose inputs still match (including still-fresh negative
/// entries); `None` on a miss.
pub type ActionLookup =
    Arc<dyn Fn(&ActionId, &BTreeMap<PathBuf, Blake3>) -> Option<ActionRecord> + Send + Sync>;

/// Everything a handler needs for one target build.
///
/// Owned (no borrows) so it can cross onto the blocking thread pool.
#[derive(Clone)]
pub struct BuildContext {
    pub target: Target,
    /// Absolute workspace root.
    pub workspace: PathBuf,
    /// Private scratch directory for this action; deleted after the build.
    pub scratch: PathBuf,
    /// Merged environment: workspace defaults overlaid with target overrides.
    pub env: BTreeMap<String, String>,
    /// Per-action timeout.
    pub timeout: Duration,
    /// Populates the action cache with file-level results.
    pub recorder: ActionRecorder,
    /// Consults the action cache for prior executions.
    pub lookup: ActionLookup,
    /// The rebuild planner's verdict for this target: the subset of its
    /// sources considered affected. `None` when no plan was computed.
    pub affected: Option<BTreeSet<PathBuf>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("target", &self.target.id)
            .field("workspace", &self.workspace)
            .field("scratch", &self.scratch)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// What a handler reports back.
#[derive(Clone, Debug, Default)]
pub struct LanguageBuildResult {
    pub success: bool,
    /// Tool diagnostics when the build failed, surfaced verbatim.
    pub error: Option<String>,
    /// Hash over all produced outputs.
    pub output_hash: Option<Blake3>,
    /// Produced artifact paths.
    pub outputs: Vec<PathBuf>,
}

impl LanguageBuildResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A per-language build capability.
pub trait LanguageHandler: Send + Sync {
    /// The language tag this handler serves.
    fn language(&self) -> &str;

    /// Build the target. Blocking; called from the blocking thread pool.
    fn build(&self, ctx: &BuildContext) -> Result<LanguageBuildResult>;

    /// Declared outputs for a target, if statically known.
    fn outputs(&self, target: &Target) -> Vec<PathBuf> {
        target.output_hint.iter().cloned().collect()
    }
}

impl std::fmt::Debug for dyn LanguageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageHandler").field("language", &self.language()).finish()
    }
}

/// Maps language tags to handler implementations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn LanguageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its language tag. Later registrations for
    /// the same tag win.
    #[instrument(name = "HandlerRegistry::register", skip_all, fields(language = handler.language()))]
    pub fn register(&self, handler: Arc<dyn LanguageHandler>) {
        let language = handler.language().to_string();
        if self.handlers.insert(language.clone(), handler).is_some() {
            warn!(%language, "replaced existing handler");
        }
    }

    /// Resolve the handler for a language tag.
    pub fn get(&self, language: &str) -> Result<Arc<dyn LanguageHandler>> {
        self.handlers.get(language).map(|h| h.value().clone()).ok_or_else(|| {
            BuildError::new(
                ErrorKind::UnsupportedLanguage,
                format!("no handler registered for language {language:?}"),
            )
            .suggest("register a handler for this language or fix the target's language tag")
            .into()
        })
    }

    pub fn languages(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

/// Generic subprocess handler for `custom` targets.
///
/// Runs the target's configured command (`config["command"]`, shell-split on
/// whitespace) in the workspace, with the merged environment applied. The
/// output hash covers every declared output's content.
#[derive(Debug)]
pub struct CommandHandler {
    language: String,
}

impl CommandHandler {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl LanguageHandler for CommandHandler {
    fn language(&self) -> &str {
        &self.language
    }

    #[instrument(name = "CommandHandler::build", skip_all, fields(target = %ctx.target.id))]
    fn build(&self, ctx: &BuildContext) -> Result<LanguageBuildResult> {
        let Some(command) = ctx.target.config.get("command") else {
            return Err(BuildError::new(
                ErrorKind::HandlerNotFound,
                format!("target {} declares no command", ctx.target.id),
            )
            .suggest("set `command` in the target's config map")
            .into());
        };

        // Fingerprint the declared sources: the inputs of this action.
        let mut inputs = BTreeMap::new();
        for source in &ctx.target.sources {
            let absolute = if source.is_absolute() {
                source.clone()
            } else {
                ctx.workspace.join(source)
            };
            inputs.insert(source.clone(), hash::content_fingerprint(&absolute)?);
        }
        let id = ActionId {
            target: ctx.target.id.clone(),
            kind: action_kind(ctx.target.kind),
            sub_id: String::new(),
            input_hash: Blake3::from_fields(inputs.values()),
        };

        // File-level reuse, independent of target-level caching: identical
        // inputs with intact outputs skip the tool entirely. When the
        // planner already saw changed sources the lookup cannot hit, so it
        // is skipped.
        let planner_saw_changes = ctx.affected.as_ref().is_some_and(|affected| !affected.is_empty());
        if !planner_saw_changes
            && let Some(record) = (ctx.lookup)(&id, &inputs)
        {
            if !record.success {
                // Still-fresh negative entry: rerunning a known-bad
                // invocation is wasted work.
                debug!(%id, "reusing recorded failure");
                return Ok(LanguageBuildResult::failed(
                    record
                        .metadata
                        .get("stderr")
                        .cloned()
                        .unwrap_or_else(|| "cached failure".to_string()),
                ));
            }
            if let Some(result) = reuse_recorded(&record, ctx)? {
                debug!(%id, "reusing recorded action");
                return Ok(result);
            }
        }

        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(BuildError::new(
                ErrorKind::SpawnFailed,
                format!("target {} has an empty command", ctx.target.id),
            )
            .into());
        };

        let mut child = std::process::Command::new(program)
            .args(parts)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| {
                BuildError::new(
                    ErrorKind::SpawnFailed,
                    format!("spawn {program:?}: {err}"),
                )
                .frame("build target", ctx.target.id.to_string())
            })?;

        // Blocking poll-wait with a deadline; we are on the blocking pool.
        let deadline = Instant::now() + ctx.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BuildError::new(
                        ErrorKind::ProcessTimeout,
                        format!("{program:?} exceeded {:?}", ctx.timeout),
                    )
                    .frame("build target", ctx.target.id.to_string())
                    .into());
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(err) => {
                    return Err(BuildError::new(
                        ErrorKind::ProcessCrashed,
                        format!("wait for {program:?}: {err}"),
                    )
                    .into());
                }
            }
        };

        let output = child.wait_with_output().map_err(|err| {
            BuildError::new(ErrorKind::ProcessCrashed, format!("collect output: {err}"))
        })?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            debug!(code = ?status.code(), "command failed");
            (ctx.recorder)(RecordedAction {
                id,
                inputs,
                outputs: Vec::new(),
                metadata: BTreeMap::from([("stderr".to_string(), stderr.clone())]),
                success: false,
            });
            return Ok(LanguageBuildResult::failed(stderr));
        }

        let outputs = self.outputs(&ctx.target);
        let mut recorded_outputs = Vec::new();
        let mut hasher_inputs = Vec::new();
        for path in &outputs {
            let absolute = ctx.workspace.join(path);
            let bytes = std::fs::read(&absolute).map_err(|err| {
                BuildError::new(
                    ErrorKind::OutputMissing,
                    format!("declared output {path:?} missing after build: {err}"),
                )
                .frame("collect outputs", ctx.target.id.to_string())
            })?;
            recorded_outputs.push(ActionOutput {
                path: path.clone(),
                hash: Blake3::from_buffer(&bytes),
            });
            hasher_inputs.push(bytes);
        }

        let output_hash = if hasher_inputs.is_empty() {
            Blake3::from_buffer(&output.stdout)
        } else {
            Blake3::from_fields(hasher_inputs.iter())
        };

        (ctx.recorder)(RecordedAction {
            id,
            inputs,
            outputs: recorded_outputs,
            metadata: BTreeMap::from([(
                "output_hash".to_string(),
                output_hash.as_str().to_string(),
            )]),
            success: true,
        });

        Ok(LanguageBuildResult {
            success: true,
            error: None,
            output_hash: Some(output_hash),
            outputs,
        })
    }
}

fn action_kind(kind: TargetKind) -> ActionKind {
    match kind {
        TargetKind::Library => ActionKind::Compile,
        TargetKind::Executable => ActionKind::Link,
        TargetKind::Test => ActionKind::Test,
        TargetKind::Custom => ActionKind::Custom,
    }
}

/// Rebuild a result from a recorded execution, verifying every recorded
/// output is still on disk with matching content. Any drift falls back to
/// running the tool.
fn reuse_recorded(record: &ActionRecord, ctx: &BuildContext) -> Result<Option<LanguageBuildResult>> {
    let Some(output_hash) = record.metadata.get("output_hash") else {
        return Ok(None);
    };

    let mut outputs = Vec::new();
    for output in &record.outputs {
        let absolute = ctx.workspace.join(&output.path);
        match std::fs::read(&absolute) {
            Ok(bytes) if Blake3::from_buffer(&bytes) == output.hash => {
                outputs.push(output.path.clone());
            }
            _ => return Ok(None),
        }
    }

    Ok(Some(LanguageBuildResult {
        success: true,
        error: None,
        output_hash: Some(Blake3::from_hex(output_hash)?),
        outputs,
    }))
}
