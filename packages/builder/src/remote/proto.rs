//! The coordinator/worker wire protocol.
//!
//! Framed messages over any stream transport. Each frame is:
//!
//! ```text
//! +------+----------------+---------+
//! | type | length (u32 BE) | payload |
//! +------+----------------+---------+
//! ```
//!
//! The payload is an [`Envelope`]: sender and receiver worker ids followed
//! by the message body in the shared big-endian, length-prefixed encoding.
//! Intra-cluster trust is assumed; deployments across untrusted networks
//! need transport-level authentication on top.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    cache::ActionId,
    codec::{Reader, Writer},
    hash::Blake3,
};

/// Frames larger than this are rejected as malformed.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Opaque worker identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("w{_0:016x}")]
pub struct WorkerId(pub u64);

impl WorkerId {
    /// The coordinator's address in envelopes.
    pub const COORDINATOR: WorkerId = WorkerId(0);

    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen::<u64>().max(1))
    }
}

/// Worker main-loop state, reported in heartbeats.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum WorkerState {
    #[display("idle")]
    Idle,
    #[display("executing")]
    Executing,
    #[display("stealing")]
    Stealing,
    #[display("draining")]
    Draining,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Executing => 1,
            Self::Stealing => 2,
            Self::Draining => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Executing),
            2 => Some(Self::Stealing),
            3 => Some(Self::Draining),
            _ => None,
        }
    }
}

/// Worker-local view of a peer, refreshed by [`PeerAnnounce`] broadcasts.
#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    pub worker: WorkerId,
    pub address: String,
    pub queue_depth: u32,
    pub load_factor: f64,
    /// Unix milliseconds of the last announce; receivers merge by timestamp.
    pub last_seen: i64,
    pub healthy: bool,
}

/// Registration request: capabilities are language tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
}

/// Periodic liveness + metrics report.
#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat {
    pub state: WorkerState,
    pub queue_depth: u32,
    pub load_factor: f64,
    /// Unix milliseconds at send time.
    pub timestamp: i64,
}

/// Pull request for up to `desired_batch` actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkRequest {
    pub desired_batch: u32,
}

/// An action assigned to a worker.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    pub action: ActionId,
    /// Language tag; matched against worker capabilities.
    pub language: String,
    pub command: Vec<String>,
    /// CAS hash and workdir-relative path for each input artifact.
    pub inputs: Vec<(Blake3, PathBuf)>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Critical-path priority; higher dispatches first.
    pub priority: u64,
}

/// The result of executing an [`ActionRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct ActionResult {
    pub action: ActionId,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    /// Peak resident set, bytes; zero when unknown.
    pub max_rss: u64,
    /// Output artifacts: workdir-relative path and CAS hash.
    pub outputs: Vec<(PathBuf, Blake3)>,
    pub success: bool,
}

/// Load broadcast re-exchanged periodically between peers.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerAnnounce {
    pub address: String,
    pub queue_depth: u32,
    pub load_factor: f64,
    pub timestamp: i64,
}

/// Request to steal up to `count` actions from a peer's queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StealRequest {
    pub count: u32,
}

/// Stolen actions; empty means the victim declined.
#[derive(Clone, Debug, PartialEq)]
pub struct StealResponse {
    pub actions: Vec<ActionRequest>,
}

/// Every message the protocol carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Registration(Registration),
    /// Coordinator's reply to a registration.
    Registered(WorkerId),
    Heartbeat(Heartbeat),
    WorkRequest(WorkRequest),
    /// Coordinator's reply to a work request.
    WorkAssignment(Vec<ActionRequest>),
    ActionRequest(ActionRequest),
    ActionResult(ActionResult),
    PeerAnnounce(PeerAnnounce),
    /// Coordinator's peer-table broadcast.
    PeerTable(Vec<Peer>),
    StealRequest(StealRequest),
    StealResponse(StealResponse),
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Registration(_) => 1,
            Self::Registered(_) => 2,
            Self::Heartbeat(_) => 3,
            Self::WorkRequest(_) => 4,
            Self::WorkAssignment(_) => 5,
            Self::ActionRequest(_) => 6,
            Self::ActionResult(_) => 7,
            Self::PeerAnnounce(_) => 8,
            Self::PeerTable(_) => 9,
            Self::StealRequest(_) => 10,
            Self::StealResponse(_) => 11,
        }
    }
}

/// Sender/receiver wrapper around any message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub sender: WorkerId,
    pub receiver: WorkerId,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: WorkerId, receiver: WorkerId, message: Message) -> Self {
        Self {
            sender,
            receiver,
            message,
        }
    }

    /// Encode into a complete frame: type byte, length, payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Writer::new();
        payload.put_u64(self.sender.0).put_u64(self.receiver.0);
        encode_message(&mut payload, &self.message);
        let payload = payload.finish();

        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(self.message.type_byte());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a frame's payload given its type byte.
    pub fn decode(type_byte: u8, payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let sender = WorkerId(r.u64()?);
        let receiver = WorkerId(r.u64()?);
        let message = decode_message(type_byte, &mut r)?;
        Ok(Self {
            sender,
            receiver,
            message,
        })
    }

    /// Write this envelope as one frame.
    pub async fn write_to(&self, stream: &mut (impl AsyncWriteExt + Unpin)) -> Result<()> {
        stream
            .write_all(&self.encode())
            .await
            .context("write frame")?;
        stream.flush().await.context("flush frame")
    }

    /// Read one frame.
    pub async fn read_from(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<Self> {
        let mut header = [0u8; 5];
        stream
            .read_exact(&mut header)
            .await
            .context("read frame header")?;
        let type_byte = header[0];
        let len = u32::from_be_bytes(header[1..5].try_into().unwrap());
        if len > MAX_FRAME_LEN {
            bail!("frame length {len} exceeds limit");
        }

        let mut payload = vec![0u8; len as usize];
        stream
            .read_exact(&mut payload)
            .await
            .context("read frame payload")?;
        Self::decode(type_byte, &payload)
    }
}

fn encode_action_request(w: &mut Writer, request: &ActionRequest) {
    request.action.encode(w);
    w.put_str(&request.language);
    w.put_u32(request.command.len() as u32);
    for arg in &request.command {
        w.put_str(arg);
    }
    w.put_u32(request.inputs.len() as u32);
    for (hash, path) in &request.inputs {
        w.put_str(hash.as_str()).put_str(&path.to_string_lossy());
    }
    w.put_u32(request.env.len() as u32);
    for (key, value) in &request.env {
        w.put_str(key).put_str(value);
    }
    w.put_u64(request.timeout.as_millis() as u64);
    w.put_u64(request.priority);
}

fn decode_action_request(r: &mut Reader<'_>) -> Result<ActionRequest> {
    let action = ActionId::decode(r)?;
    let language = r.str()?.to_string();
    let mut command = Vec::new();
    for _ in 0..r.u32()? {
        command.push(r.str()?.to_string());
    }
    let mut inputs = Vec::new();
    for _ in 0..r.u32()? {
        let hash = Blake3::from_hex(r.str()?)?;
        inputs.push((hash, PathBuf::from(r.str()?)));
    }
    let mut env = BTreeMap::new();
    for _ in 0..r.u32()? {
        let key = r.str()?.to_string();
        let value = r.str()?.to_string();
        env.insert(key, value);
    }
    let timeout = Duration::from_millis(r.u64()?);
    let priority = r.u64()?;
    Ok(ActionRequest {
        action,
        language,
        command,
        inputs,
        env,
        timeout,
        priority,
    })
}

fn encode_message(w: &mut Writer, message: &Message) {
    match message {
        Message::Registration(reg) => {
            w.put_u32(reg.capabilities.len() as u32);
            for capability in &reg.capabilities {
                w.put_str(capability);
            }
            w.put_u32(reg.max_concurrent);
        }
        Message::Registered(worker) => {
            w.put_u64(worker.0);
        }
        Message::Heartbeat(beat) => {
            w.put_u8(beat.state.as_u8());
            w.put_u32(beat.queue_depth);
            w.put_u64(beat.load_factor.to_bits());
            w.put_i64(beat.timestamp);
        }
        Message::WorkRequest(req) => {
            w.put_u32(req.desired_batch);
        }
        Message::WorkAssignment(actions) => {
            w.put_u32(actions.len() as u32);
            for action in actions {
                encode_action_request(w, action);
            }
        }
        Message::ActionRequest(request) => {
            encode_action_request(w, request);
        }
        Message::ActionResult(result) => {
            result.action.encode(w);
            w.put_i64(result.exit_code.into());
            w.put_bytes(&result.stdout);
            w.put_bytes(&result.stderr);
            w.put_u64(result.duration.as_millis() as u64);
            w.put_u64(result.max_rss);
            w.put_u32(result.outputs.len() as u32);
            for (path, hash) in &result.outputs {
                w.put_str(&path.to_string_lossy()).put_str(hash.as_str());
            }
            w.put_bool(result.success);
        }
        Message::PeerAnnounce(announce) => {
            w.put_str(&announce.address);
            w.put_u32(announce.queue_depth);
            w.put_u64(announce.load_factor.to_bits());
            w.put_i64(announce.timestamp);
        }
        Message::PeerTable(peers) => {
            w.put_u32(peers.len() as u32);
            for peer in peers {
                w.put_u64(peer.worker.0);
                w.put_str(&peer.address);
                w.put_u32(peer.queue_depth);
                w.put_u64(peer.load_factor.to_bits());
                w.put_i64(peer.last_seen);
                w.put_bool(peer.healthy);
            }
        }
        Message::StealRequest(req) => {
            w.put_u32(req.count);
        }
        Message::StealResponse(resp) => {
            w.put_u32(resp.actions.len() as u32);
            for action in &resp.actions {
                encode_action_request(w, action);
            }
        }
    }
}

fn decode_message(type_byte: u8, r: &mut Reader<'_>) -> Result<Message> {
    Ok(match type_byte {
        1 => {
            let mut capabilities = Vec::new();
            for _ in 0..r.u32()? {
                capabilities.push(r.str()?.to_string());
            }
            Message::Registration(Registration {
                capabilities,
                max_concurrent: r.u32()?,
            })
        }
        2 => Message::Registered(WorkerId(r.u64()?)),
        3 => {
            let state = WorkerState::from_u8(r.u8()?)
                .ok_or_else(|| color_eyre::eyre::eyre!("unknown worker state"))?;
            Message::Heartbeat(Heartbeat {
                state,
                queue_depth: r.u32()?,
                load_factor: f64::from_bits(r.u64()?),
                timestamp: r.i64()?,
            })
        }
        4 => Message::WorkRequest(WorkRequest {
            desired_batch: r.u32()?,
        }),
        5 => {
            let mut actions = Vec::new();
            for _ in 0..r.u32()? {
                actions.push(decode_action_request(r)?);
            }
            Message::WorkAssignment(actions)
        }
        6 => Message::ActionRequest(decode_action_request(r)?),
        7 => {
            let action = ActionId::decode(r)?;
            let exit_code = r.i64()? as i32;
            let stdout = r.bytes()?.to_vec();
            let stderr = r.bytes()?.to_vec();
            let duration = Duration::from_millis(r.u64()?);
            let max_rss = r.u64()?;
            let mut outputs = Vec::new();
            for _ in 0..r.u32()? {
                let path = PathBuf::from(r.str()?);
                outputs.push((path, Blake3::from_hex(r.str()?)?));
            }
            Message::ActionResult(ActionResult {
                action,
                exit_code,
                stdout,
                stderr,
                duration,
                max_rss,
                outputs,
                success: r.bool()?,
            })
        }
        8 => Message::PeerAnnounce(PeerAnnounce {
            address: r.str()?.to_string(),
            queue_depth: r.u32()?,
            load_factor: f64::from_bits(r.u64()?),
            timestamp: r.i64()?,
        }),
        9 => {
            let mut peers = Vec::new();
            for _ in 0..r.u32()? {
                peers.push(Peer {
                    worker: WorkerId(r.u64()?),
                    address: r.str()?.to_string(),
                    queue_depth: r.u32()?,
                    load_factor: f64::from_bits(r.u64()?),
                    last_seen: r.i64()?,
                    healthy: r.bool()?,
                });
            }
            Message::PeerTable(peers)
        }
        10 => Message::StealRequest(StealRequest { count: r.u32()? }),
        11 => {
            let mut actions = Vec::new();
            for _ in 0..r.u32()? {
                actions.push(decode_action_request(r)?);
            }
            Message::StealResponse(StealResponse { actions })
        }
        other => bail!("unknown message type {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::ActionKind,
        target::TargetId,
    };
    use pretty_assertions::assert_eq;

    fn sample_action() -> ActionRequest {
        ActionRequest {
            action: ActionId {
                target: TargetId::new("ws", "pkg", "lib"),
                kind: ActionKind::Compile,
                sub_id: "a.c".to_string(),
                input_hash: Blake3::from_buffer(b"inputs"),
            },
            language: "c".to_string(),
            command: vec!["cc".to_string(), "-c".to_string(), "a.c".to_string()],
            inputs: vec![(Blake3::from_buffer(b"src"), PathBuf::from("a.c"))],
            env: BTreeMap::from([("CC".to_string(), "cc".to_string())]),
            timeout: Duration::from_secs(60),
            priority: 7,
        }
    }

    fn round_trip(message: Message) -> Envelope {
        let envelope = Envelope::new(WorkerId(3), WorkerId(9), message);
        let frame = envelope.encode();
        assert_eq!(frame[0], envelope.message.type_byte());
        let len = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 5);
        Envelope::decode(frame[0], &frame[5..]).unwrap()
    }

    #[test]
    fn envelope_round_trips_every_message_kind() {
        let messages = vec![
            Message::Registration(Registration {
                capabilities: vec!["c".to_string(), "rust".to_string()],
                max_concurrent: 8,
            }),
            Message::Registered(WorkerId(17)),
            Message::Heartbeat(Heartbeat {
                state: WorkerState::Executing,
                queue_depth: 4,
                load_factor: 0.62,
                timestamp: 1_700_000_000_000,
            }),
            Message::WorkRequest(WorkRequest { desired_batch: 3 }),
            Message::WorkAssignment(vec![sample_action()]),
            Message::ActionRequest(sample_action()),
            Message::ActionResult(ActionResult {
                action: sample_action().action,
                exit_code: 0,
                stdout: b"ok".to_vec(),
                stderr: Vec::new(),
                duration: Duration::from_millis(1234),
                max_rss: 1 << 20,
                outputs: vec![(PathBuf::from("a.o"), Blake3::from_buffer(b"obj"))],
                success: true,
            }),
            Message::PeerAnnounce(PeerAnnounce {
                address: "10.0.0.2:9400".to_string(),
                queue_depth: 12,
                load_factor: 0.9,
                timestamp: 1_700_000_000_500,
            }),
            Message::PeerTable(vec![Peer {
                worker: WorkerId(5),
                address: "10.0.0.5:9400".to_string(),
                queue_depth: 1,
                load_factor: 0.1,
                last_seen: 1_700_000_000_000,
                healthy: true,
            }]),
            Message::StealRequest(StealRequest { count: 2 }),
            Message::StealResponse(StealResponse {
                actions: vec![sample_action()],
            }),
        ];

        for message in messages {
            let decoded = round_trip(message.clone());
            assert_eq!(decoded.sender, WorkerId(3));
            assert_eq!(decoded.receiver, WorkerId(9));
            assert_eq!(decoded.message, message);
        }
    }

    #[tokio::test]
    async fn frames_cross_a_stream_transport() {
        let envelope = Envelope::new(
            WorkerId::random(),
            WorkerId::COORDINATOR,
            Message::WorkRequest(WorkRequest { desired_batch: 1 }),
        );

        let (mut client, mut server) = tokio::io::duplex(4096);
        envelope.write_to(&mut client).await.unwrap();
        let received = Envelope::read_from(&mut server).await.unwrap();
        assert_eq!(received, envelope);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(Envelope::decode(200, &[0; 16]).is_err());
    }
}
