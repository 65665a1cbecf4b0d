//! The presence CRDT: an observed-remove-style state CRDT storing
//! `(topic, key, meta)` bindings tagged by their originating replica, with
//! merge, delta extraction, and replica hide/purge operations.
//!
//! The tracker server is the only intended caller; CRDT internals
//! (tombstone tag sets) are deliberately not exposed beyond the operations
//! below.

mod diff;
mod entry;
mod state;

pub use diff::{Diff, TopicDiff};
pub use entry::{Meta, Pid, PresenceEntry, Tag, PHX_REF, PHX_REF_PREV};
pub use state::{PresenceDelta, PresenceState, SyncPayload};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound on caller-supplied presence keys. Blanket-implemented for any type
/// satisfying it; callers never implement this by hand.
pub trait PresenceKey: Clone + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> PresenceKey for T where T: Clone + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}
