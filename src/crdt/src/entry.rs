use presence_clock::ReplicaRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for the local session that created a presence entry. Only
/// meaningful on the replica that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Caller-supplied metadata, augmented with `phx_ref`/`phx_ref_prev` by the
/// tracker server. `BTreeMap` rather than `HashMap` so snapshots and test
/// fixtures have a deterministic iteration order.
pub type Meta = std::collections::BTreeMap<String, serde_json::Value>;

pub const PHX_REF: &str = "phx_ref";
pub const PHX_REF_PREV: &str = "phx_ref_prev";

/// Causal tag assigned at insert time: the replica that created the entry
/// plus a per-replica monotonic counter. Globally unique, so it doubles as
/// the CRDT's element identity (no per-value add-counter map is needed the
/// way a general OR-Set requires, since every `join` mints a fresh tag).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub origin: ReplicaRef,
    pub counter: u64,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.counter)
    }
}

/// One presence entry: `((pid, topic), (key, meta))`, addressable by `Tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry<K> {
    pub pid: Pid,
    pub topic: String,
    pub key: K,
    pub meta: Meta,
}
