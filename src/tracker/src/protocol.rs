use presence_clock::ReplicaRef;
use presence_crdt::{PresenceDelta, PresenceKey, SyncPayload};
use serde::{Deserialize, Serialize};

/// Wire messages exchanged between tracker servers over the namespaced
/// topic `"phx_presence:<server_name>"`. `#[non_exhaustive]` so a future
/// variant can be added without breaking callers matching on this type;
/// an unrecognized tag on the wire is simply dropped by serde's own
/// deserialize failure path (logged at `debug!`, per the "unknown inbound
/// message" error kind).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage<K: PresenceKey> {
    Heartbeat {
        from: ReplicaRef,
        delta: PresenceDelta<K>,
    },
    TransferReq {
        xfer_ref: String,
        from: ReplicaRef,
    },
    TransferAck {
        xfer_ref: String,
        from: ReplicaRef,
        snapshot: SyncPayload<K>,
    },
}
