//! Replica identity and vector clocks.
//!
//! A replica is identified by a `(name, vsn)` pair (spec: a restart yields a
//! fresh `vsn`, which is how peers learn that previously-seen state from
//! that `name` is stale). Vector clocks track, per known replica, how many
//! of its events we have observed, and are used to decide which peers are
//! ahead of us and therefore worth requesting a transfer from.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of one tracker replica: a stable node name plus a nonce chosen
/// once at start. Two records with the same `name` but different `vsn`
/// refer to different incarnations of that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaRef {
    pub name: Arc<str>,
    pub vsn: u64,
}

impl ReplicaRef {
    pub fn new(name: impl Into<Arc<str>>, vsn: u64) -> Self {
        Self {
            name: name.into(),
            vsn,
        }
    }
}

// Ordering is by name first, then vsn, so a `BTreeMap<ReplicaRef, _>` groups
// all incarnations of the same node name together.
impl PartialOrd for ReplicaRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReplicaRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name).then(self.vsn.cmp(&other.vsn))
    }
}

impl fmt::Display for ReplicaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.vsn)
    }
}

/// A vector clock over replica names (not `(name, vsn)` pairs — a restart
/// keeps accumulating on the same counter line, since the registry, not the
/// clock, is what treats a `vsn` change specially).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<Arc<str>, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica_name: &str) -> u64 {
        self.counters.get(replica_name).copied().unwrap_or(0)
    }

    /// Bump the counter for `replica_name` and return the new value.
    pub fn increment(&mut self, replica_name: impl Into<Arc<str>>) -> u64 {
        let counter = self.counters.entry(replica_name.into()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise max merge (commutative, associative, idempotent).
    pub fn merge(&mut self, other: &VectorClock) {
        for (name, &count) in &other.counters {
            let entry = self.counters.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// `self` dominates `other` if it has observed at least as much of every
    /// replica's history as `other` has.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .counters
            .iter()
            .all(|(name, &count)| self.get(name) >= count)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn replica_names(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(|s| s.as_ref())
    }
}

/// One peer's advertised clock position, as carried on a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaClock {
    pub vsn: u64,
    pub vector_clock: VectorClock,
}

/// Bounded accumulation of recently-observed peer clocks (spec §3 "Pending
/// clock set"), used once per `clock_sample_periods` heartbeats to decide
/// which peers to request a transfer from (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct PendingClockSet {
    entries: Vec<(ReplicaRef, VectorClock)>,
}

impl PendingClockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in every `(name, {vsn, vector_clock})` advertised by a peer's
    /// heartbeat or by our own local state.
    pub fn record(&mut self, clocks: &BTreeMap<Arc<str>, ReplicaClock>) {
        for (name, clock) in clocks {
            let replica = ReplicaRef::new(name.clone(), clock.vsn);
            self.entries.push((replica, clock.vector_clock.clone()));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The set of `(name, vsn)` peers whose vector clock is not dominated by
    /// any clock currently accumulated — i.e. peers known to have observed
    /// events we have not (spec §4.4 step 2).
    pub fn divergent_peers(&self, local: &VectorClock) -> Vec<ReplicaRef> {
        self.entries
            .iter()
            .filter(|(_, clock)| !local.dominates(clock))
            .map(|(replica, _)| replica.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
