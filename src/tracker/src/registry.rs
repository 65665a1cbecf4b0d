use presence_clock::ReplicaRef;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Up,
    Down,
    Permdown,
}

#[derive(Debug, Clone)]
pub struct ReplicaRecord {
    pub name: Arc<str>,
    pub vsn: u64,
    pub status: ReplicaStatus,
    pub last_heartbeat_at: Instant,
}

impl ReplicaRecord {
    pub fn replica_ref(&self) -> ReplicaRef {
        ReplicaRef::new(self.name.clone(), self.vsn)
    }
}

/// Tracks every known peer replica's identity, liveness status, and
/// last-seen time. Transition *classification* (what CRDT calls a
/// transition implies) is the tracker server's job, not the registry's.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    records: BTreeMap<Arc<str>, ReplicaRecord>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ReplicaRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaRecord> {
        self.records.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.records.keys()
    }

    /// Upsert `(name, vsn)`, setting `status := up` and refreshing
    /// `last_heartbeat_at`. Returns the prior record, if any, and the
    /// record now stored.
    pub fn put_heartbeat(
        &mut self,
        name: impl Into<Arc<str>>,
        vsn: u64,
        now: Instant,
    ) -> (Option<ReplicaRecord>, ReplicaRecord) {
        let name = name.into();
        let current = ReplicaRecord {
            name: name.clone(),
            vsn,
            status: ReplicaStatus::Up,
            last_heartbeat_at: now,
        };
        let prev = self.records.insert(name, current.clone());
        (prev, current)
    }

    /// Apply the liveness timeout rule to one record: `up` -> `down` after
    /// `down_period`, `down` -> `permdown` after `permdown_period`,
    /// `permdown` is terminal. Returns `(prev, current)` even when
    /// unchanged, so the caller's no-op case is explicit; the record is
    /// evicted once it reaches `permdown` (a later heartbeat under the
    /// same name is then treated as brand new, per `put_heartbeat`'s
    /// `prev = None` case).
    pub fn detect_down(
        &mut self,
        name: &str,
        down_period: Duration,
        permdown_period: Duration,
        now: Instant,
    ) -> Option<(ReplicaRecord, ReplicaRecord)> {
        let prev = self.records.get(name)?.clone();
        let silence = now.saturating_duration_since(prev.last_heartbeat_at);

        let next_status = match prev.status {
            ReplicaStatus::Up if silence >= down_period => ReplicaStatus::Down,
            ReplicaStatus::Down if silence >= permdown_period => ReplicaStatus::Permdown,
            other => other,
        };

        if next_status == prev.status {
            return Some((prev.clone(), prev));
        }

        let mut current = prev.clone();
        current.status = next_status;

        if next_status == ReplicaStatus::Permdown {
            self.records.remove(name);
        } else {
            self.records.insert(name.into(), current.clone());
        }

        Some((prev, current))
    }
}
