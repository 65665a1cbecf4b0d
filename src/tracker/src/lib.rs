//! The tracker server: the per-node replication engine that drives
//! heartbeat cadence, applies local `track`/`untrack`/`update` calls,
//! merges remote heartbeats and transfers, detects down peers, and invokes
//! the application's diff handler.

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::TrackerConfig;
pub use error::TrackerError;
pub use protocol::WireMessage;
pub use registry::{ReplicaRecord, ReplicaRegistry, ReplicaStatus};
pub use server::{DiffHandler, TrackerHandle, TrackerServer};

pub use presence_crdt::{Meta, Pid, PHX_REF, PHX_REF_PREV};
