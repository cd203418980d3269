//! Distributed execution: coordinator, workers, stealing, autoscaling.
//!
//! The coordinator assigns actions to remote workers over a framed binary
//! protocol; idle workers steal from busy peers over the same transport.
//! The pool autoscaler watches cluster metrics and drives an injectable
//! provisioner.

pub mod autoscale;
pub mod coordinator;
pub mod executor;
pub mod proto;
pub mod worker;

pub use autoscale::{AutoscaleConfig, Autoscaler, Provisioner, ScaleDecision};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use executor::{DistributedExecutor, ResultRouter};
pub use proto::{
    ActionRequest, ActionResult, Envelope, Heartbeat, Message, Peer, PeerAnnounce, Registration,
    StealRequest, StealResponse, WorkRequest, WorkerId, WorkerState,
};
pub use worker::{LocalWorkSource, StealPolicy, Worker, WorkerConfig, WorkerShared, WorkSource};
