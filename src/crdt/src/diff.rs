use crate::entry::Meta;
use std::collections::BTreeMap;

/// Joins and leaves observed for a single topic as the result of a CRDT
/// operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDiff<K> {
    pub joins: Vec<(K, Meta)>,
    pub leaves: Vec<(K, Meta)>,
}

impl<K> TopicDiff<K> {
    fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Per-topic `(joins, leaves)` produced by `merge`, `replica_up`, and
/// `replica_down`. Empty topics are never stored, so `is_empty` is a cheap
/// `BTreeMap::is_empty`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff<K> {
    pub topics: BTreeMap<String, TopicDiff<K>>,
}

impl<K: Ord> Diff<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.values().all(TopicDiff::is_empty)
    }

    pub fn push_join(&mut self, topic: impl Into<String>, key: K, meta: Meta) {
        self.topics
            .entry(topic.into())
            .or_default()
            .joins
            .push((key, meta));
    }

    pub fn push_leave(&mut self, topic: impl Into<String>, key: K, meta: Meta) {
        self.topics
            .entry(topic.into())
            .or_default()
            .leaves
            .push((key, meta));
    }

    pub fn merge(&mut self, other: Diff<K>) {
        for (topic, other_diff) in other.topics {
            let entry = self.topics.entry(topic).or_default();
            entry.joins.extend(other_diff.joins);
            entry.leaves.extend(other_diff.leaves);
        }
    }
}
