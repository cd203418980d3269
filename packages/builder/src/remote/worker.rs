//! The remote worker: a single-threaded cooperative main loop with
//! peer-to-peer work stealing.
//!
//! Each pass of the loop tries, in order: the local queue (LIFO pop for
//! cache locality), the coordinator, then stealing from a peer. When
//! everything is empty the loop backs off: yield for the first ten
//! attempts, then exponential sleep with jitter capped at 100 ms.
//!
//! The local queue is a Chase-Lev deque: the owner pushes and pops at one
//! end, thieves steal FIFO from the other. A steal takes an action
//! atomically or not at all; an action already popped for execution can
//! never migrate.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use crossbeam_deque::{Steal, Stealer};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    cas::FsCas,
    error::{BuildError, ErrorKind},
    fs,
};

use super::{
    coordinator::now_millis,
    proto::{
        ActionRequest, ActionResult, Envelope, Heartbeat, Message, Peer, PeerAnnounce,
        StealRequest, StealResponse, WorkerId, WorkerState,
    },
};

/// How a thief picks its victim.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StealPolicy {
    /// Sample two random healthy peers, steal from the better-scoring one.
    PowerOfTwo,
    /// Query all peers, steal from the most loaded. Used while the
    /// power-of-two success rate is poor.
    MostLoaded,
}

/// Worker tuning knobs.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Language tags this worker can execute; empty accepts anything.
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
    /// Nominal local queue capacity, used only for the load factor.
    pub queue_capacity: u32,
    /// Victims with fewer queued actions than this reject steals.
    pub steal_threshold: u32,
    /// Steal attempts remembered for the adaptive policy window.
    pub steal_window: usize,
    /// Batch size requested from the coordinator.
    pub pull_batch: u32,
    /// Where per-action working directories are created.
    pub scratch_root: PathBuf,
    /// Address peers dial for stealing.
    pub address: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            max_concurrent: 1,
            queue_capacity: 64,
            steal_threshold: 4,
            steal_window: 20,
            pull_batch: 4,
            scratch_root: std::env::temp_dir().join("builder-worker"),
            address: "127.0.0.1:0".to_string(),
        }
    }
}

/// State shared with thieves and the steal server; `Sync` unlike the deque
/// owner handle.
#[derive(Debug)]
pub struct WorkerShared {
    pub id: WorkerId,
    config: WorkerConfig,
    stealer: Stealer<ActionRequest>,
    /// Tracked explicitly; the deque does not expose a length.
    depth: AtomicU32,
    executing: AtomicBool,
    peers: RwLock<HashMap<WorkerId, Peer>>,
    steal_outcomes: Mutex<VecDeque<bool>>,
}

impl WorkerShared {
    pub fn queue_depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// `0.7 * (queue / capacity) + 0.3 * executing / max_concurrent`.
    pub fn load_factor(&self) -> f64 {
        let queue = f64::from(self.queue_depth()) / f64::from(self.config.queue_capacity.max(1));
        let executing = if self.executing.load(Ordering::Acquire) {
            1.0
        } else {
            0.0
        };
        0.7 * queue.min(1.0) + 0.3 * executing / f64::from(self.config.max_concurrent.max(1))
    }

    /// Victim side of the steal protocol: donate up to `count` actions from
    /// the FIFO end, or nothing while the queue is below the threshold.
    #[instrument(name = "WorkerShared::try_donate", skip(self))]
    pub fn try_donate(&self, count: u32) -> Vec<ActionRequest> {
        if self.queue_depth() < self.config.steal_threshold {
            trace!(depth = self.queue_depth(), "queue below steal threshold, declining");
            return Vec::new();
        }

        let mut donated = Vec::new();
        while donated.len() < count as usize {
            match self.stealer.steal() {
                Steal::Success(action) => {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    donated.push(action);
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        donated
    }

    pub fn handle_steal_request(&self, request: StealRequest) -> StealResponse {
        StealResponse {
            actions: self.try_donate(request.count),
        }
    }

    /// Merge a peer record by timestamp; stale announces lose.
    pub fn update_peer(&self, peer: Peer) {
        if peer.worker == self.id {
            return;
        }
        let mut peers = self.peers.write().expect("peer lock poisoned");
        match peers.get(&peer.worker) {
            Some(existing) if existing.last_seen > peer.last_seen => {}
            _ => {
                peers.insert(peer.worker, peer);
            }
        }
    }

    pub fn update_peers(&self, table: Vec<Peer>) {
        for peer in table {
            self.update_peer(peer);
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .expect("peer lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn record_steal(&self, success: bool) {
        let mut outcomes = self.steal_outcomes.lock().expect("steal stats poisoned");
        outcomes.push_back(success);
        while outcomes.len() > self.config.steal_window {
            outcomes.pop_front();
        }
    }

    /// Fraction of recent steal attempts that succeeded; 1.0 with no data.
    pub fn steal_success_rate(&self) -> f64 {
        let outcomes = self.steal_outcomes.lock().expect("steal stats poisoned");
        if outcomes.is_empty() {
            return 1.0;
        }
        outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64
    }

    /// Adaptive policy: most-loaded victim selection while the recent
    /// power-of-two success rate sits below 30%.
    pub fn steal_policy(&self) -> StealPolicy {
        let outcomes = self.steal_outcomes.lock().expect("steal stats poisoned");
        let sampled = outcomes.len();
        drop(outcomes);
        if sampled >= 5 && self.steal_success_rate() < 0.3 {
            StealPolicy::MostLoaded
        } else {
            StealPolicy::PowerOfTwo
        }
    }

    /// Pick a victim from the healthy peer set per the current policy.
    ///
    /// Power-of-two: sample two random peers, score each as
    /// `queue_depth * 10 - load_factor * 5`, request from the higher.
    pub fn select_victim(&self) -> Option<Peer> {
        let healthy: Vec<Peer> = self
            .peers()
            .into_iter()
            .filter(|peer| peer.healthy && peer.queue_depth >= self.config.steal_threshold)
            .collect();
        if healthy.is_empty() {
            return None;
        }

        match self.steal_policy() {
            StealPolicy::MostLoaded => healthy
                .into_iter()
                .max_by(|a, b| a.queue_depth.cmp(&b.queue_depth)),
            StealPolicy::PowerOfTwo => {
                let mut rng = rand::thread_rng();
                let sampled: Vec<&Peer> = healthy.choose_multiple(&mut rng, 2).collect();
                sampled
                    .into_iter()
                    .max_by(|a, b| score(a).total_cmp(&score(b)))
                    .cloned()
            }
        }
    }

    fn heartbeat(&self, state: WorkerState) -> Heartbeat {
        Heartbeat {
            state,
            queue_depth: self.queue_depth(),
            load_factor: self.load_factor(),
            timestamp: now_millis(),
        }
    }

    fn announce(&self) -> PeerAnnounce {
        PeerAnnounce {
            address: self.config.address.clone(),
            queue_depth: self.queue_depth(),
            load_factor: self.load_factor(),
            timestamp: now_millis(),
        }
    }
}

fn score(peer: &Peer) -> f64 {
    f64::from(peer.queue_depth) * 10.0 - peer.load_factor * 5.0
}

/// The coordinator as seen from a worker.
///
/// Abstracted so the main loop runs identically over TCP and in-process
/// (tests, single-machine mode).
pub trait WorkSource: Send + Sync + 'static {
    fn request_work(
        &self,
        worker: WorkerId,
        batch: u32,
    ) -> impl Future<Output = Result<Vec<ActionRequest>>> + Send;

    fn submit_result(
        &self,
        worker: WorkerId,
        result: ActionResult,
    ) -> impl Future<Output = Result<()>> + Send;

    fn heartbeat(
        &self,
        worker: WorkerId,
        beat: Heartbeat,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Announce our load; the reply is the coordinator's peer table.
    fn announce(
        &self,
        worker: WorkerId,
        announce: PeerAnnounce,
    ) -> impl Future<Output = Result<Vec<Peer>>> + Send;
}

/// In-process work source wrapping a [`super::Coordinator`].
#[derive(Clone)]
pub struct LocalWorkSource(pub Arc<super::Coordinator>);

impl WorkSource for LocalWorkSource {
    async fn request_work(&self, worker: WorkerId, batch: u32) -> Result<Vec<ActionRequest>> {
        Ok(self.0.request_work(worker, batch))
    }

    async fn submit_result(&self, worker: WorkerId, result: ActionResult) -> Result<()> {
        self.0.submit_result(worker, result)
    }

    async fn heartbeat(&self, worker: WorkerId, beat: Heartbeat) -> Result<()> {
        self.0.heartbeat(worker, beat)
    }

    async fn announce(&self, worker: WorkerId, announce: PeerAnnounce) -> Result<Vec<Peer>> {
        self.0.peer_announce(worker, announce)?;
        Ok(self.0.peers())
    }
}

/// A remote executor node.
///
/// Owns the deque handle (the owner end is not `Sync`); everything thieves
/// and background tasks need lives in [`WorkerShared`].
pub struct Worker {
    local: crossbeam_deque::Worker<ActionRequest>,
    shared: Arc<WorkerShared>,
    cas: Arc<FsCas>,
}

impl Worker {
    pub fn new(id: WorkerId, config: WorkerConfig, cas: Arc<FsCas>) -> Self {
        let local = crossbeam_deque::Worker::new_lifo();
        let shared = Arc::new(WorkerShared {
            id,
            stealer: local.stealer(),
            depth: AtomicU32::new(0),
            executing: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            steal_outcomes: Mutex::new(VecDeque::new()),
            config,
        });
        Self { local, shared, cas }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Producer side of the deque: only this worker pushes.
    pub fn push_local(&self, action: ActionRequest) {
        self.local.push(action);
        self.shared.depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Owner pop: LIFO, for cache locality.
    pub fn pop_local(&self) -> Option<ActionRequest> {
        let action = self.local.pop();
        if action.is_some() {
            self.shared.depth.fetch_sub(1, Ordering::AcqRel);
        }
        action
    }

    /// Steal from `victim` over the wire. One round trip per attempt.
    #[instrument(name = "Worker::steal_over_network", skip(self))]
    pub async fn steal_over_network(&self, victim: &Peer, count: u32) -> Result<Vec<ActionRequest>> {
        let mut stream = tokio::net::TcpStream::connect(&victim.address)
            .await
            .map_err(|err| {
                BuildError::new(
                    ErrorKind::CoordinatorUnreachable,
                    format!("dial peer {}: {err}", victim.address),
                )
            })?;

        let request = Envelope::new(
            self.shared.id,
            victim.worker,
            Message::StealRequest(StealRequest { count }),
        );
        request.write_to(&mut stream).await?;

        let reply = Envelope::read_from(&mut stream).await?;
        match reply.message {
            Message::StealResponse(response) => Ok(response.actions),
            other => Err(BuildError::new(
                ErrorKind::WorkerFailed,
                format!("peer answered steal with {other:?}"),
            )
            .into()),
        }
    }

    /// One steal attempt per the adaptive policy. Returns how many actions
    /// landed in the local queue.
    #[instrument(name = "Worker::attempt_steal", skip(self))]
    pub async fn attempt_steal(&self) -> usize {
        let Some(victim) = self.shared.select_victim() else {
            return 0;
        };

        match self.steal_over_network(&victim, self.shared.config.pull_batch).await {
            Ok(actions) if !actions.is_empty() => {
                debug!(victim = %victim.worker, stolen = actions.len(), "steal succeeded");
                self.shared.record_steal(true);
                let count = actions.len();
                for action in actions {
                    self.push_local(action);
                }
                count
            }
            Ok(_) => {
                trace!(victim = %victim.worker, "steal declined");
                self.shared.record_steal(false);
                0
            }
            Err(err) => {
                debug!(victim = %victim.worker, ?err, "steal failed");
                self.shared.record_steal(false);
                0
            }
        }
    }

    /// The main loop: local queue, coordinator, steal, backoff.
    #[instrument(name = "Worker::run", skip_all, fields(id = %self.shared.id))]
    pub async fn run<S: WorkSource>(
        self,
        source: S,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut idle_attempts = 0u32;
        let mut last_heartbeat = Instant::now();
        const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

        info!("worker loop starting");
        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("worker loop stopping");
                return Ok(());
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
                let state = if self.shared.queue_depth() > 0 {
                    WorkerState::Executing
                } else {
                    WorkerState::Idle
                };
                if let Err(err) = source.heartbeat(self.shared.id, self.shared.heartbeat(state)).await
                {
                    warn!(?err, "heartbeat failed");
                }
                match source.announce(self.shared.id, self.shared.announce()).await {
                    Ok(table) => self.shared.update_peers(table),
                    Err(err) => warn!(?err, "peer announce failed"),
                }
                last_heartbeat = Instant::now();
            }

            // 1. Local queue.
            if let Some(action) = self.pop_local() {
                idle_attempts = 0;
                let result = self.execute(action).await;
                if let Err(err) = source.submit_result(self.shared.id, result).await {
                    warn!(?err, "result submission failed");
                }
                continue;
            }

            // 2. Coordinator.
            match source
                .request_work(self.shared.id, self.shared.config.pull_batch)
                .await
            {
                Ok(actions) if !actions.is_empty() => {
                    idle_attempts = 0;
                    for action in actions {
                        self.push_local(action);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(err) => warn!(?err, "work request failed"),
            }

            // 3. Steal from a peer.
            if self.attempt_steal().await > 0 {
                idle_attempts = 0;
                continue;
            }

            // 4. Empty everywhere: back off.
            idle_attempts += 1;
            backoff(idle_attempts).await;
        }
    }

    /// Execute one action: materialize inputs from the CAS, run the command,
    /// store outputs back into the CAS, reclaim the scratch directory.
    #[instrument(name = "Worker::execute", skip_all, fields(action = %action.action))]
    pub async fn execute(&self, action: ActionRequest) -> ActionResult {
        self.shared.executing.store(true, Ordering::Release);
        let started = Instant::now();
        let result = self.execute_inner(&action).await;
        self.shared.executing.store(false, Ordering::Release);

        match result {
            Ok(result) => result,
            Err(err) => {
                warn!(?err, "action execution errored");
                ActionResult {
                    action: action.action,
                    exit_code: -1,
                    stdout: Vec::new(),
                    stderr: format!("{err:#}").into_bytes(),
                    duration: started.elapsed(),
                    max_rss: 0,
                    outputs: Vec::new(),
                    success: false,
                }
            }
        }
    }

    async fn execute_inner(&self, action: &ActionRequest) -> Result<ActionResult> {
        let started = Instant::now();
        let workdir = self
            .shared
            .config
            .scratch_root
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&workdir).await?;

        // Inputs come out of the CAS into their declared workdir paths.
        let mut input_paths = Vec::new();
        for (hash, rel) in &action.inputs {
            let bytes = self.cas.must_get_blob(hash).await.map_err(|err| {
                BuildError::new(
                    ErrorKind::ArtifactTransferFailed,
                    format!("fetch input {rel:?}: {err:#}"),
                )
            })?;
            let dst = workdir.join(rel);
            fs::write_atomic(&dst, &bytes).await?;
            input_paths.push(rel.clone());
        }

        let Some((program, args)) = action.command.split_first() else {
            return Err(BuildError::new(
                ErrorKind::SpawnFailed,
                format!("action {} has an empty command", action.action),
            )
            .into());
        };

        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&workdir)
            .envs(&action.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| {
                BuildError::new(ErrorKind::SpawnFailed, format!("spawn {program:?}: {err}"))
            })?;

        let output = match tokio::time::timeout(action.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|err| {
                BuildError::new(ErrorKind::ProcessCrashed, format!("wait {program:?}: {err}"))
            })?,
            Err(_) => {
                let _ = fs::remove_dir_all_idempotent(&workdir).await;
                return Err(BuildError::new(
                    ErrorKind::ProcessTimeout,
                    format!("{program:?} exceeded {:?}", action.timeout),
                )
                .into());
            }
        };

        // Outputs: everything in the workdir that was not an input, stored
        // into the CAS before the result is submitted.
        let mut outputs = Vec::new();
        if output.status.success() {
            for entry in walkdir::WalkDir::new(&workdir).min_depth(1) {
                let entry = entry.context("scan workdir")?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&workdir)
                    .context("relativize output")?
                    .to_path_buf();
                if input_paths.contains(&rel) {
                    continue;
                }
                let bytes = fs::must_read(entry.path()).await?;
                let hash = self.cas.put_blob(&bytes).await?;
                outputs.push((rel, hash));
            }
        }

        // Scratch is reclaimed only after outputs are safely in the CAS.
        if let Err(err) = fs::remove_dir_all_idempotent(&workdir).await {
            warn!(?workdir, ?err, "failed to reclaim scratch");
        }

        Ok(ActionResult {
            action: action.action.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: started.elapsed(),
            max_rss: 0,
            outputs,
            success: output.status.success(),
        })
    }

    /// Serve steal requests from peers; run as a background task.
    #[instrument(name = "Worker::serve_steals", skip_all, fields(id = %shared.id))]
    pub async fn serve_steals(
        shared: Arc<WorkerShared>,
        listener: tokio::net::TcpListener,
    ) -> Result<()> {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(?err, "steal accept failed");
                    continue;
                }
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Ok(envelope) = Envelope::read_from(&mut stream).await {
                    let Message::StealRequest(request) = envelope.message else {
                        break;
                    };
                    let response = shared.handle_steal_request(request);
                    let reply = Envelope::new(
                        shared.id,
                        envelope.sender,
                        Message::StealResponse(response),
                    );
                    if reply.write_to(&mut stream).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

/// Idle backoff: yield for the first ten attempts, then exponential sleep
/// with jitter, capped at 100 ms.
async fn backoff(attempt: u32) {
    if attempt <= 10 {
        tokio::task::yield_now().await;
        return;
    }
    let exponent = (attempt - 10).min(7);
    let base = Duration::from_millis(1 << exponent).min(Duration::from_millis(100));
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=base / 2);
    tokio::time::sleep((base + jitter).min(Duration::from_millis(100))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::ActionKind, hash::Blake3, target::TargetId};
    use pretty_assertions::assert_eq;

    fn request(name: &str) -> ActionRequest {
        ActionRequest {
            action: crate::cache::ActionId {
                target: TargetId::new("ws", "pkg", name),
                kind: ActionKind::Compile,
                sub_id: name.to_string(),
                input_hash: Blake3::from_buffer(name),
            },
            language: "c".to_string(),
            command: vec!["true".to_string()],
            inputs: Vec::new(),
            env: Default::default(),
            timeout: Duration::from_secs(10),
            priority: 0,
        }
    }

    async fn worker(id: u64, dir: &std::path::Path) -> Worker {
        let cas = Arc::new(FsCas::open(dir.join(format!("cas-{id}"))).await.unwrap());
        Worker::new(WorkerId(id), WorkerConfig::default(), cas)
    }

    fn peer(id: u64, depth: u32, load: f64) -> Peer {
        Peer {
            worker: WorkerId(id),
            address: format!("10.0.0.{id}:9400"),
            queue_depth: depth,
            load_factor: load,
            last_seen: now_millis(),
            healthy: true,
        }
    }

    #[test_log::test(tokio::test)]
    async fn owner_pops_lifo_thieves_steal_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;

        for name in ["first", "second", "third", "fourth", "fifth"] {
            w.push_local(request(name));
        }

        // Owner takes the most recently pushed.
        assert_eq!(w.pop_local().unwrap().action.sub_id, "fifth");

        // A thief drains from the opposite (oldest) end.
        let stolen = w.shared().try_donate(2);
        assert_eq!(stolen.len(), 2);
        assert_eq!(stolen[0].action.sub_id, "first");
        assert_eq!(stolen[1].action.sub_id, "second");
        assert_eq!(w.shared().queue_depth(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn victims_below_threshold_decline() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;

        // Threshold is 4; three queued actions are not enough.
        for name in ["a", "b", "c"] {
            w.push_local(request(name));
        }
        assert!(w.shared().try_donate(2).is_empty());

        w.push_local(request("d"));
        assert_eq!(w.shared().try_donate(2).len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn stolen_actions_appear_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let victim = worker(1, dir.path()).await;
        for i in 0..100 {
            victim.push_local(request(&format!("a{i}")));
        }

        let shared = victim.shared();
        let thief = tokio::task::spawn_blocking(move || {
            let mut stolen = Vec::new();
            loop {
                let batch = shared.try_donate(4);
                if batch.is_empty() {
                    break;
                }
                stolen.extend(batch);
            }
            stolen
        });

        let mut popped = Vec::new();
        while let Some(action) = victim.pop_local() {
            popped.push(action);
        }
        let stolen = thief.await.unwrap();

        // Exactly one of thief or victim holds each action.
        let mut all: Vec<String> = popped
            .iter()
            .chain(stolen.iter())
            .map(|a| a.action.sub_id.clone())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), popped.len() + stolen.len(), "no action claimed twice");
        assert!(all.len() <= 100);
        // Depth settles to zero once both sides drained.
        assert_eq!(victim.shared().queue_depth() as usize, 100 - popped.len() - stolen.len());
    }

    #[test_log::test(tokio::test)]
    async fn power_of_two_prefers_the_higher_score() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;
        let shared = w.shared();

        // Exactly two candidates: selection must pick the deeper queue.
        shared.update_peer(peer(2, 20, 0.9));
        shared.update_peer(peer(3, 5, 0.1));

        for _ in 0..16 {
            let victim = shared.select_victim().unwrap();
            assert_eq!(victim.worker, WorkerId(2));
        }
    }

    #[test_log::test(tokio::test)]
    async fn adaptive_policy_switches_on_poor_success() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;
        let shared = w.shared();

        assert_eq!(shared.steal_policy(), StealPolicy::PowerOfTwo);
        for _ in 0..10 {
            shared.record_steal(false);
        }
        assert_eq!(shared.steal_policy(), StealPolicy::MostLoaded);

        for _ in 0..10 {
            shared.record_steal(true);
        }
        assert_eq!(shared.steal_policy(), StealPolicy::PowerOfTwo);
    }

    #[test_log::test(tokio::test)]
    async fn shallow_peers_are_never_victims() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;
        let shared = w.shared();

        shared.update_peer(peer(2, 1, 0.0));
        shared.update_peer(peer(3, 2, 0.0));
        assert!(shared.select_victim().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn peer_merge_is_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(1, dir.path()).await;
        let shared = w.shared();

        let mut fresh = peer(2, 10, 0.5);
        fresh.last_seen = 2_000;
        let mut stale = peer(2, 99, 0.9);
        stale.last_seen = 1_000;

        shared.update_peer(fresh);
        shared.update_peer(stale);
        let peers = shared.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].queue_depth, 10);
    }
}
