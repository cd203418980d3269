//! The distributed coordinator.
//!
//! Workers pull, the coordinator never pushes: a worker registers, then
//! periodically heartbeats and requests batches of ready actions. Actions
//! assigned to a worker that times out or vanishes are requeued with their
//! attempt count incremented; execution is assumed idempotent (the action
//! key addresses its outputs in the CAS, so a re-run produces identical
//! bytes).

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::Result;
use dashmap::DashMap;
use jiff::Timestamp;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::ActionId,
    error::{BuildError, ErrorKind},
};

use super::proto::{
    ActionRequest, ActionResult, Envelope, Heartbeat, Message, Peer, PeerAnnounce, Registration,
    WorkerId, WorkerState,
};

/// Coordinator tuning knobs.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// A worker silent for longer than this is unhealthy; its in-flight
    /// actions requeue.
    pub heartbeat_timeout: Duration,
    /// Batch size handed out when a worker does not say otherwise.
    pub default_batch: u32,
    /// Assignments older than this requeue even if the worker heartbeats.
    pub assignment_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(15),
            default_batch: 4,
            assignment_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct WorkerEntry {
    capabilities: Vec<String>,
    max_concurrent: u32,
    state: WorkerState,
    queue_depth: u32,
    load_factor: f64,
    address: String,
    last_seen: Instant,
    /// Millisecond timestamp of the newest merged report; receivers merge
    /// heartbeats and announces by timestamp, not arrival order.
    last_report: i64,
    healthy: bool,
    draining: bool,
}

#[derive(Debug)]
struct QueuedAction {
    request: ActionRequest,
    attempts: u32,
    seq: Reverse<u64>,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.seq == other.seq
    }
}
impl Eq for QueuedAction {}
impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.request.priority, &self.seq).cmp(&(other.request.priority, &other.seq))
    }
}
impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct InFlight {
    worker: WorkerId,
    request: ActionRequest,
    attempts: u32,
    assigned_at: Instant,
}

/// Assigns ready actions to workers and tracks their liveness.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    workers: DashMap<WorkerId, WorkerEntry>,
    queue: Mutex<BinaryHeap<QueuedAction>>,
    in_flight: DashMap<ActionId, InFlight>,
    results_tx: flume::Sender<ActionResult>,
    seq: AtomicU64,
}

impl Coordinator {
    /// Create a coordinator and the channel on which results arrive.
    pub fn new(config: CoordinatorConfig) -> (Self, flume::Receiver<ActionResult>) {
        let (results_tx, results_rx) = flume::unbounded();
        (
            Self {
                config,
                workers: DashMap::new(),
                queue: Mutex::new(BinaryHeap::new()),
                in_flight: DashMap::new(),
                results_tx,
                seq: AtomicU64::new(0),
            },
            results_rx,
        )
    }

    /// Register a worker, minting its id.
    #[instrument(name = "Coordinator::register", skip(self))]
    pub fn register(&self, registration: Registration, address: String) -> WorkerId {
        let id = WorkerId::random();
        info!(%id, %address, capabilities = ?registration.capabilities, "worker registered");
        self.workers.insert(
            id,
            WorkerEntry {
                capabilities: registration.capabilities,
                max_concurrent: registration.max_concurrent,
                state: WorkerState::Idle,
                queue_depth: 0,
                load_factor: 0.0,
                address,
                last_seen: Instant::now(),
                last_report: 0,
                healthy: true,
                draining: false,
            },
        );
        id
    }

    /// Merge a heartbeat. Stale reports (older timestamp than the last
    /// merged one) are ignored.
    #[instrument(name = "Coordinator::heartbeat", skip(self, beat))]
    pub fn heartbeat(&self, worker: WorkerId, beat: Heartbeat) -> Result<()> {
        let mut entry = self.workers.get_mut(&worker).ok_or_else(|| {
            BuildError::new(ErrorKind::WorkerFailed, format!("heartbeat from unknown {worker}"))
        })?;
        entry.last_seen = Instant::now();
        entry.healthy = true;
        if beat.timestamp >= entry.last_report {
            entry.last_report = beat.timestamp;
            entry.state = beat.state;
            entry.queue_depth = beat.queue_depth;
            entry.load_factor = beat.load_factor;
        }
        Ok(())
    }

    /// Enqueue a ready action.
    pub fn submit(&self, request: ActionRequest) {
        self.enqueue(request, 0);
    }

    fn enqueue(&self, request: ActionRequest, attempts: u32) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push(QueuedAction {
                request,
                attempts,
                seq: Reverse(seq),
            });
    }

    /// Hand out up to `desired_batch` actions the worker is capable of.
    ///
    /// Draining and unknown workers receive nothing.
    #[instrument(name = "Coordinator::request_work", skip(self))]
    pub fn request_work(&self, worker: WorkerId, desired_batch: u32) -> Vec<ActionRequest> {
        let capabilities = match self.workers.get(&worker) {
            Some(entry) if entry.healthy && !entry.draining => entry.capabilities.clone(),
            _ => return Vec::new(),
        };

        let batch = if desired_batch == 0 {
            self.config.default_batch
        } else {
            desired_batch
        };

        let mut assigned = Vec::new();
        let mut unassignable = Vec::new();
        {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            while assigned.len() < batch as usize {
                let Some(queued) = queue.pop() else {
                    break;
                };
                let capable = capabilities.is_empty()
                    || capabilities.iter().any(|c| *c == queued.request.language);
                if capable {
                    assigned.push(queued);
                } else {
                    unassignable.push(queued);
                }
            }
            for queued in unassignable {
                queue.push(queued);
            }
        }

        let now = Instant::now();
        assigned
            .into_iter()
            .map(|queued| {
                self.in_flight.insert(
                    queued.request.action.clone(),
                    InFlight {
                        worker,
                        request: queued.request.clone(),
                        attempts: queued.attempts,
                        assigned_at: now,
                    },
                );
                queued.request
            })
            .collect()
    }

    /// Accept a result from a worker and forward it to the consumer.
    ///
    /// Results for actions this worker does not own are dropped: the action
    /// was requeued (worker presumed dead) and may have been re-assigned.
    #[instrument(name = "Coordinator::submit_result", skip(self, result), fields(action = %result.action))]
    pub fn submit_result(&self, worker: WorkerId, result: ActionResult) -> Result<()> {
        match self.in_flight.get(&result.action) {
            Some(entry) if entry.worker == worker => {}
            Some(entry) => {
                warn!(
                    %worker,
                    owner = %entry.worker,
                    "dropping result from non-owning worker",
                );
                return Ok(());
            }
            None => {
                warn!(%worker, "dropping result for unassigned action");
                return Ok(());
            }
        }
        self.in_flight.remove(&result.action);

        self.results_tx
            .send(result)
            .map_err(|_| BuildError::new(ErrorKind::InitFailed, "result consumer gone").into())
    }

    /// Merge a peer announce, by timestamp.
    pub fn peer_announce(&self, worker: WorkerId, announce: PeerAnnounce) -> Result<()> {
        let mut entry = self.workers.get_mut(&worker).ok_or_else(|| {
            BuildError::new(ErrorKind::WorkerFailed, format!("announce from unknown {worker}"))
        })?;
        entry.last_seen = Instant::now();
        if announce.timestamp >= entry.last_report {
            entry.last_report = announce.timestamp;
            entry.address = announce.address;
            entry.queue_depth = announce.queue_depth;
            entry.load_factor = announce.load_factor;
        }
        Ok(())
    }

    /// Snapshot of the healthy peer table for broadcast.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .workers
            .iter()
            .map(|entry| Peer {
                worker: *entry.key(),
                address: entry.address.clone(),
                queue_depth: entry.queue_depth,
                load_factor: entry.load_factor,
                last_seen: entry.last_report,
                healthy: entry.healthy && !entry.draining,
            })
            .collect();
        peers.sort_by_key(|peer| peer.worker);
        peers
    }

    /// Requeue work from silent or stuck workers. Call periodically.
    #[instrument(name = "Coordinator::sweep", skip(self))]
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        for mut entry in self.workers.iter_mut() {
            if entry.healthy && now.duration_since(entry.last_seen) > self.config.heartbeat_timeout
            {
                warn!(worker = %entry.key(), "heartbeat timeout, marking unhealthy");
                entry.healthy = false;
                dead.push(*entry.key());
            }
        }

        // Requeue: actions on dead workers, and assignments that outlived
        // the assignment timeout regardless of worker health.
        let mut requeue = Vec::new();
        for entry in self.in_flight.iter() {
            let expired =
                now.duration_since(entry.assigned_at) > self.config.assignment_timeout;
            if dead.contains(&entry.worker) || expired {
                requeue.push(entry.request.action.clone());
            }
        }
        for action in requeue {
            if let Some((_, in_flight)) = self.in_flight.remove(&action) {
                debug!(%action, attempts = in_flight.attempts + 1, "requeueing action");
                self.enqueue(in_flight.request, in_flight.attempts + 1);
            }
        }
    }

    /// Stop assigning new work to a worker; used by the autoscaler before
    /// deprovisioning.
    pub fn mark_draining(&self, worker: WorkerId) {
        if let Some(mut entry) = self.workers.get_mut(&worker) {
            entry.draining = true;
        }
    }

    /// Remove a worker entirely, requeueing anything it still held.
    #[instrument(name = "Coordinator::unregister", skip(self))]
    pub fn unregister(&self, worker: WorkerId) {
        self.workers.remove(&worker);
        let held: Vec<ActionId> = self
            .in_flight
            .iter()
            .filter(|entry| entry.worker == worker)
            .map(|entry| entry.key().clone())
            .collect();
        for action in held {
            if let Some((_, in_flight)) = self.in_flight.remove(&action) {
                self.enqueue(in_flight.request, in_flight.attempts + 1);
            }
        }
    }

    /// Worker ids ordered by load, least-utilized first; drain candidates.
    pub fn least_utilized(&self, count: usize) -> Vec<WorkerId> {
        let mut loads: Vec<(WorkerId, f64)> = self
            .workers
            .iter()
            .filter(|entry| entry.healthy && !entry.draining)
            .map(|entry| (*entry.key(), entry.load_factor))
            .collect();
        loads.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        loads.into_iter().take(count).map(|(id, _)| id).collect()
    }

    /// Whether a worker's queue is empty as far as the coordinator knows.
    pub fn worker_idle(&self, worker: WorkerId) -> bool {
        let queue_empty = self
            .workers
            .get(&worker)
            .map(|entry| entry.queue_depth == 0)
            .unwrap_or(true);
        let nothing_in_flight = !self.in_flight.iter().any(|entry| entry.worker == worker);
        queue_empty && nothing_in_flight
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Aggregate utilization in `[0, 1]`: executing workers over capacity.
    pub fn utilization(&self) -> f64 {
        let mut capacity = 0u32;
        let mut busy = 0.0;
        for entry in self.workers.iter() {
            if !entry.healthy {
                continue;
            }
            capacity += entry.max_concurrent.max(1);
            busy += entry.load_factor * f64::from(entry.max_concurrent.max(1));
        }
        if capacity == 0 {
            0.0
        } else {
            (busy / f64::from(capacity)).clamp(0.0, 1.0)
        }
    }

    /// Handle one envelope from the wire, producing an optional reply.
    ///
    /// The accept loop calls this per frame; it is also directly callable in
    /// tests, which keeps protocol handling transport-independent.
    #[instrument(name = "Coordinator::handle", skip_all)]
    pub fn handle(&self, envelope: Envelope, remote_address: &str) -> Result<Option<Envelope>> {
        let sender = envelope.sender;
        let reply = |message: Message| {
            Some(Envelope::new(WorkerId::COORDINATOR, sender, message))
        };

        Ok(match envelope.message {
            Message::Registration(registration) => {
                let id = self.register(registration, remote_address.to_string());
                reply(Message::Registered(id))
            }
            Message::Heartbeat(beat) => {
                self.heartbeat(sender, beat)?;
                None
            }
            Message::WorkRequest(request) => {
                let actions = self.request_work(sender, request.desired_batch);
                reply(Message::WorkAssignment(actions))
            }
            Message::ActionResult(result) => {
                self.submit_result(sender, result)?;
                None
            }
            Message::PeerAnnounce(announce) => {
                self.peer_announce(sender, announce)?;
                reply(Message::PeerTable(self.peers()))
            }
            other => {
                warn!(?other, "coordinator received unexpected message");
                None
            }
        })
    }

    /// Accept loop: one task per connection, frames handled in order.
    #[instrument(name = "Coordinator::serve", skip_all)]
    pub async fn serve(
        self: std::sync::Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> Result<()> {
        loop {
            let (mut stream, address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(?err, "accept failed");
                    continue;
                }
            };
            let coordinator = std::sync::Arc::clone(&self);
            tokio::spawn(async move {
                let address = address.to_string();
                loop {
                    let envelope = match Envelope::read_from(&mut stream).await {
                        Ok(envelope) => envelope,
                        Err(_) => break,
                    };
                    match coordinator.handle(envelope, &address) {
                        Ok(Some(reply)) => {
                            if reply.write_to(&mut stream).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!(?err, "protocol error, closing connection");
                            break;
                        }
                    }
                }
            });
        }
    }

    /// Periodic liveness sweeping; run as a background task.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}

/// Millisecond timestamp helper shared with the worker side.
pub(crate) fn now_millis() -> i64 {
    Timestamp::now().as_millisecond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::ActionKind, hash::Blake3, target::TargetId};
    use pretty_assertions::assert_eq;

    fn request(name: &str, language: &str, priority: u64) -> ActionRequest {
        ActionRequest {
            action: ActionId {
                target: TargetId::new("ws", "pkg", name),
                kind: ActionKind::Compile,
                sub_id: name.to_string(),
                input_hash: Blake3::from_buffer(name),
            },
            language: language.to_string(),
            command: vec!["cc".to_string()],
            inputs: Vec::new(),
            env: Default::default(),
            timeout: Duration::from_secs(60),
            priority,
        }
    }

    fn register(coordinator: &Coordinator, capabilities: &[&str]) -> WorkerId {
        coordinator.register(
            Registration {
                capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
                max_concurrent: 4,
            },
            "10.0.0.1:9400".to_string(),
        )
    }

    #[test]
    fn work_is_pulled_in_priority_order() {
        let (coordinator, _results) = Coordinator::new(CoordinatorConfig::default());
        let worker = register(&coordinator, &["c"]);

        coordinator.submit(request("low", "c", 1));
        coordinator.submit(request("high", "c", 10));
        coordinator.submit(request("mid", "c", 5));

        let batch = coordinator.request_work(worker, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].action.sub_id, "high");
        assert_eq!(batch[1].action.sub_id, "mid");
        assert_eq!(coordinator.queue_len(), 1);
    }

    #[test]
    fn capabilities_filter_assignment() {
        let (coordinator, _results) = Coordinator::new(CoordinatorConfig::default());
        let c_worker = register(&coordinator, &["c"]);

        coordinator.submit(request("a", "rust", 1));
        assert!(coordinator.request_work(c_worker, 4).is_empty());
        // The action stays queued for a capable worker.
        assert_eq!(coordinator.queue_len(), 1);

        let rust_worker = register(&coordinator, &["rust"]);
        assert_eq!(coordinator.request_work(rust_worker, 4).len(), 1);
    }

    #[test]
    fn results_round_trip_and_clear_in_flight() {
        let (coordinator, results) = Coordinator::new(CoordinatorConfig::default());
        let worker = register(&coordinator, &["c"]);
        coordinator.submit(request("a", "c", 1));

        let batch = coordinator.request_work(worker, 1);
        let action = batch[0].action.clone();
        coordinator
            .submit_result(
                worker,
                ActionResult {
                    action: action.clone(),
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    duration: Duration::from_millis(10),
                    max_rss: 0,
                    outputs: Vec::new(),
                    success: true,
                },
            )
            .unwrap();

        assert_eq!(results.recv().unwrap().action, action);
        // A duplicate result (e.g. from a stale worker) is dropped.
        coordinator
            .submit_result(
                worker,
                ActionResult {
                    action,
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    duration: Duration::from_millis(10),
                    max_rss: 0,
                    outputs: Vec::new(),
                    success: true,
                },
            )
            .unwrap();
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn heartbeat_timeout_requeues_in_flight_work() {
        let config = CoordinatorConfig {
            heartbeat_timeout: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        let (coordinator, _results) = Coordinator::new(config);
        let worker = register(&coordinator, &["c"]);
        coordinator.submit(request("a", "c", 1));

        assert_eq!(coordinator.request_work(worker, 1).len(), 1);
        assert_eq!(coordinator.queue_len(), 0);

        std::thread::sleep(Duration::from_millis(5));
        coordinator.sweep();
        // Back in the queue; the dead worker gets nothing.
        assert_eq!(coordinator.queue_len(), 1);
        assert!(coordinator.request_work(worker, 1).is_empty());
    }

    #[test]
    fn stale_reports_do_not_regress_state() {
        let (coordinator, _results) = Coordinator::new(CoordinatorConfig::default());
        let worker = register(&coordinator, &["c"]);

        coordinator
            .heartbeat(
                worker,
                Heartbeat {
                    state: WorkerState::Executing,
                    queue_depth: 5,
                    load_factor: 0.8,
                    timestamp: 2_000,
                },
            )
            .unwrap();
        // An older report arrives late; it must not overwrite.
        coordinator
            .heartbeat(
                worker,
                Heartbeat {
                    state: WorkerState::Idle,
                    queue_depth: 0,
                    load_factor: 0.0,
                    timestamp: 1_000,
                },
            )
            .unwrap();

        let peers = coordinator.peers();
        assert_eq!(peers[0].queue_depth, 5);
    }

    #[test]
    fn draining_workers_receive_no_work() {
        let (coordinator, _results) = Coordinator::new(CoordinatorConfig::default());
        let worker = register(&coordinator, &["c"]);
        coordinator.submit(request("a", "c", 1));

        coordinator.mark_draining(worker);
        assert!(coordinator.request_work(worker, 1).is_empty());
        assert!(coordinator.worker_idle(worker));

        coordinator.unregister(worker);
        assert_eq!(coordinator.worker_count(), 0);
    }
}
