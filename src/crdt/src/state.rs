use crate::diff::Diff;
use crate::entry::{Meta, Pid, PresenceEntry, Tag, PHX_REF, PHX_REF_PREV};
use crate::PresenceKey;
use presence_clock::{ReplicaClock, ReplicaRef, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The delta a replica has accumulated since its last `reset_delta`: enough
/// to let a peer that already has everything up to our last broadcast catch
/// up without a full transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceDelta<K> {
    pub added: BTreeMap<Tag, PresenceEntry<K>>,
    pub removed: BTreeSet<Tag>,
    pub clocks: BTreeMap<Arc<str>, ReplicaClock>,
}

impl<K> PresenceDelta<K> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Either a full state snapshot (for transfers) or an incremental delta
/// (for routine heartbeat broadcasts). Opaque to the transport, per the
/// pub/sub contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncPayload<K> {
    State(PresenceState<K>),
    Delta(PresenceDelta<K>),
}

/// The presence CRDT: a state-based, observed-remove-style set of tagged
/// entries. `merge` is commutative, associative, and idempotent, since it
/// only ever grows the `added`/`removed` tag sets (invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceState<K> {
    self_ref: ReplicaRef,
    next_counter: u64,
    vector_clock: VectorClock,
    added: BTreeMap<Tag, PresenceEntry<K>>,
    removed: BTreeSet<Tag>,

    // Local-only bookkeeping, never serialized onto the wire: whether a
    // replica is hidden is this replica's own liveness judgment, not
    // something to trust blindly from a remote snapshot, and the delta
    // buffers are reset on every broadcast.
    #[serde(skip)]
    down: BTreeSet<ReplicaRef>,
    #[serde(skip)]
    delta_added: BTreeMap<Tag, PresenceEntry<K>>,
    #[serde(skip)]
    delta_removed: BTreeSet<Tag>,

    // Unlike `down`, this travels on the wire: a transfer recipient needs
    // the sender's view of every third-party peer's clock, not just the
    // sender's own, or `merge`'s dominance checks only ever see one hop.
    peer_clocks: BTreeMap<Arc<str>, ReplicaClock>,
}

impl<K: PresenceKey> PresenceState<K> {
    pub fn new(self_ref: ReplicaRef) -> Self {
        Self {
            self_ref,
            next_counter: 0,
            vector_clock: VectorClock::new(),
            added: BTreeMap::new(),
            removed: BTreeSet::new(),
            down: BTreeSet::new(),
            delta_added: BTreeMap::new(),
            delta_removed: BTreeSet::new(),
            peer_clocks: BTreeMap::new(),
        }
    }

    pub fn self_ref(&self) -> &ReplicaRef {
        &self.self_ref
    }

    fn mint_tag(&mut self) -> Tag {
        self.next_counter += 1;
        self.vector_clock.increment(self.self_ref.name.clone());
        Tag {
            origin: self.self_ref.clone(),
            counter: self.next_counter,
        }
    }

    fn is_visible(&self, tag: &Tag) -> bool {
        self.added.contains_key(tag) && !self.removed.contains(tag) && !self.down.contains(&tag.origin)
    }

    fn tombstone(&mut self, tag: Tag) {
        self.removed.insert(tag.clone());
        self.delta_removed.insert(tag);
    }

    /// Find the live tag this replica currently holds for `(pid, topic, key)`,
    /// per invariant 2 ("at most one live presence" within one replica).
    fn find_own_live(&self, pid: Pid, topic: &str, key: &K) -> Option<Tag> {
        self.added.iter().find_map(|(tag, entry)| {
            (tag.origin == self.self_ref
                && entry.pid == pid
                && entry.topic == topic
                && &entry.key == key
                && self.is_visible(tag))
            .then(|| tag.clone())
        })
    }

    /// Add or replace a local entry. Returns the tag and the meta augmented
    /// with a fresh `phx_ref`.
    pub fn join(&mut self, pid: Pid, topic: impl Into<String>, key: K, mut meta: Meta) -> (Tag, Meta) {
        let topic = topic.into();
        if let Some(old_tag) = self.find_own_live(pid, &topic, &key) {
            self.tombstone(old_tag);
        }

        let tag = self.mint_tag();
        let phx_ref = fresh_ref();
        meta.insert(PHX_REF.to_string(), serde_json::Value::String(phx_ref));

        let entry = PresenceEntry {
            pid,
            topic,
            key,
            meta: meta.clone(),
        };
        self.added.insert(tag.clone(), entry.clone());
        self.delta_added.insert(tag.clone(), entry);
        (tag, meta)
    }

    /// Remove the one live local entry for `(pid, topic, key)`, if any.
    pub fn leave_key(&mut self, pid: Pid, topic: &str, key: &K) -> Option<(K, Meta)> {
        let tag = self.find_own_live(pid, topic, key)?;
        let entry = self.added.get(&tag)?.clone();
        self.tombstone(tag);
        Some((entry.key, entry.meta))
    }

    /// Remove every live local entry for `pid`. Returns `(topic, key, meta)`
    /// for each one removed.
    pub fn leave_pid(&mut self, pid: Pid) -> Vec<(String, K, Meta)> {
        let tags: Vec<Tag> = self
            .added
            .iter()
            .filter(|(tag, entry)| tag.origin == self.self_ref && entry.pid == pid && self.is_visible(tag))
            .map(|(tag, _)| tag.clone())
            .collect();

        let mut removed = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(entry) = self.added.get(&tag).cloned() {
                self.tombstone(tag);
                removed.push((entry.topic, entry.key, entry.meta));
            }
        }
        removed
    }

    /// Merge a full remote state or delta, returning the entries that
    /// newly became visible and the ones that disappeared from the locally
    /// visible view.
    pub fn merge(&mut self, payload: SyncPayload<K>) -> Diff<K> {
        let (added, removed, clocks) = match payload {
            SyncPayload::State(remote) => (remote.added, remote.removed, remote.peer_clocks_with_self()),
            SyncPayload::Delta(delta) => (delta.added, delta.removed, delta.clocks),
        };
        self.merge_clocks(&clocks);
        self.merge_added_removed(added, removed)
    }

    fn merge_added_removed(
        &mut self,
        added: BTreeMap<Tag, PresenceEntry<K>>,
        removed: BTreeSet<Tag>,
    ) -> Diff<K> {
        let mut diff = Diff::new();

        for (tag, entry) in added {
            if self.added.contains_key(&tag) {
                continue;
            }
            let visible = !self.removed.contains(&tag) && !self.down.contains(&tag.origin);
            if visible {
                diff.push_join(entry.topic.clone(), entry.key.clone(), entry.meta.clone());
            }
            self.added.insert(tag, entry);
        }

        for tag in removed {
            if self.removed.contains(&tag) {
                continue;
            }
            if let Some(entry) = self.added.get(&tag) {
                if !self.down.contains(&tag.origin) {
                    diff.push_leave(entry.topic.clone(), entry.key.clone(), entry.meta.clone());
                }
            }
            self.removed.insert(tag);
        }

        diff
    }

    fn merge_clocks(&mut self, incoming: &BTreeMap<Arc<str>, ReplicaClock>) {
        for (name, clock) in incoming {
            self.vector_clock.merge(&clock.vector_clock);
            let slot = self.peer_clocks.entry(name.clone()).or_insert_with(|| clock.clone());
            if clock.vsn >= slot.vsn {
                slot.vector_clock.merge(&clock.vector_clock);
                slot.vsn = clock.vsn;
            }
        }
    }

    fn peer_clocks_with_self(&self) -> BTreeMap<Arc<str>, ReplicaClock> {
        let mut out = self.peer_clocks.clone();
        out.insert(
            self.self_ref.name.clone(),
            ReplicaClock {
                vsn: self.self_ref.vsn,
                vector_clock: self.vector_clock.clone(),
            },
        );
        out
    }

    /// Produce a transfer snapshot and clear the accumulated delta. The
    /// snapshot carries the full `added`/`removed` tag sets but never the
    /// local `down` judgment (see the struct doc comment).
    pub fn extract(&mut self) -> SyncPayload<K> {
        let snapshot = SyncPayload::State(self.clone());
        self.reset_delta();
        snapshot
    }

    pub fn extract_delta(&self) -> PresenceDelta<K> {
        PresenceDelta {
            added: self.delta_added.clone(),
            removed: self.delta_removed.clone(),
            clocks: self.peer_clocks_with_self(),
        }
    }

    pub fn has_delta(&self) -> bool {
        !self.delta_added.is_empty() || !self.delta_removed.is_empty()
    }

    pub fn reset_delta(&mut self) {
        self.delta_added.clear();
        self.delta_removed.clear();
    }

    pub fn clocks(&self) -> BTreeMap<Arc<str>, ReplicaClock> {
        self.peer_clocks_with_self()
    }

    /// Unhide presences owned by `replica` (its heartbeats resumed, or a
    /// partition healed before `permdown_period`).
    pub fn replica_up(&mut self, replica: &ReplicaRef) -> Diff<K> {
        if !self.down.remove(replica) {
            return Diff::new();
        }
        let mut diff = Diff::new();
        for (tag, entry) in &self.added {
            if &tag.origin == replica && !self.removed.contains(tag) {
                diff.push_join(entry.topic.clone(), entry.key.clone(), entry.meta.clone());
            }
        }
        diff
    }

    /// Hide presences owned by `replica` without deleting them, so they can
    /// reappear without a transfer if the replica comes back before
    /// `permdown_period` (invariant 5).
    pub fn replica_down(&mut self, replica: &ReplicaRef) -> Diff<K> {
        if !self.down.insert(replica.clone()) {
            return Diff::new();
        }
        let mut diff = Diff::new();
        for (tag, entry) in &self.added {
            if &tag.origin == replica && !self.removed.contains(tag) {
                diff.push_leave(entry.topic.clone(), entry.key.clone(), entry.meta.clone());
            }
        }
        diff
    }

    /// Permanently delete every presence owned by `replica` (invariant 4).
    /// No diff: those entries were already reported as leaves when the
    /// replica went `down`, except for the compound `up -> permdown`
    /// transition, which the tracker server handles by calling
    /// `replica_down` first.
    pub fn remove_down_replicas(&mut self, replica: &ReplicaRef) {
        self.down.remove(replica);
        let tags: Vec<Tag> = self
            .added
            .keys()
            .filter(|tag| &tag.origin == replica)
            .cloned()
            .collect();
        for tag in tags {
            self.added.remove(&tag);
            self.removed.remove(&tag);
            self.delta_added.remove(&tag);
            self.delta_removed.remove(&tag);
        }
        self.peer_clocks.remove(&replica.name);
    }

    pub fn get_by_topic(&self, topic: &str) -> Vec<(K, Meta)> {
        self.added
            .iter()
            .filter(|(tag, entry)| entry.topic == topic && self.is_visible(tag))
            .map(|(_, entry)| (entry.key.clone(), entry.meta.clone()))
            .collect()
    }

    pub fn get_by_pid(&self, pid: Pid) -> Vec<(String, K, Meta)> {
        self.added
            .iter()
            .filter(|(tag, entry)| entry.pid == pid && self.is_visible(tag))
            .map(|(_, entry)| (entry.topic.clone(), entry.key.clone(), entry.meta.clone()))
            .collect()
    }

    pub fn get_by_pid_topic_key(&self, pid: Pid, topic: &str, key: &K) -> Option<Meta> {
        self.added.iter().find_map(|(tag, entry)| {
            (entry.pid == pid && entry.topic == topic && &entry.key == key && self.is_visible(tag))
                .then(|| entry.meta.clone())
        })
    }
}

/// A base64-encoded random 64-bit value, globally unique with overwhelming
/// probability (invariant 1) regardless of how many replicas share a `vsn`.
fn fresh_ref() -> String {
    use base64::Engine;
    let bytes = rand::random::<u64>().to_be_bytes();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
