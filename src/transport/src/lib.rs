//! Pub/sub transport contract (spec: subscribe / broadcast_from /
//! direct_broadcast / node_name) plus `LocalTransport`, an in-process
//! multi-node test double. Framing, node discovery, and delivery guarantees
//! beyond best-effort fan-out are a real transport's problem, not this
//! crate's; `LocalTransport` exists only so the tracker is runnable and
//! testable without external infrastructure.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no subscriber known for node {0:?}")]
    UnknownNode(String),
    #[error("subscriber channel closed")]
    ChannelClosed,
}

/// The transport contract the tracker server depends on. At-most-once,
/// best-effort fan-out; no ordering guarantees across subscribers.
#[async_trait]
pub trait PubSub: Send + Sync {
    type Message: Clone + Send + Sync + 'static;

    /// Deliver subsequent broadcasts on `topic` to the returned channel.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Self::Message>, TransportError>;

    /// Deliver to every subscriber of `topic` on every node except `publisher`.
    async fn broadcast_from(
        &self,
        publisher: &str,
        topic: &str,
        msg: Self::Message,
    ) -> Result<(), TransportError>;

    /// Deliver only to subscribers of `topic` on `node`.
    async fn direct_broadcast(&self, node: &str, topic: &str, msg: Self::Message) -> Result<(), TransportError>;

    /// This node's stable name.
    fn node_name(&self) -> &str;
}

type Subscribers<Msg> = HashMap<Arc<str>, Vec<mpsc::UnboundedSender<Msg>>>;
type Registry<Msg> = HashMap<String, Subscribers<Msg>>;

/// A cluster of `LocalTransport` handles sharing one in-process routing
/// table. Tests and the demo binary create one cluster and hand each
/// simulated node its own `LocalTransport::node_name()`-scoped handle.
pub struct LocalCluster<Msg> {
    registry: Arc<Mutex<Registry<Msg>>>,
    partitioned: Arc<Mutex<HashSet<Arc<str>>>>,
}

impl<Msg> Default for LocalCluster<Msg> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            partitioned: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<Msg> LocalCluster<Msg> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, name: impl Into<Arc<str>>) -> LocalTransport<Msg> {
        LocalTransport {
            node: name.into(),
            registry: self.registry.clone(),
            partitioned: self.partitioned.clone(),
        }
    }

    /// Simulate severing (`true`) or restoring (`true` -> `false`) a node's
    /// link to the rest of the cluster. A partitioned node's broadcasts are
    /// dropped before delivery and it is skipped as a recipient of others'
    /// broadcasts, mirroring a real network split rather than a crash: the
    /// node's own task keeps running, it just can't reach or be reached.
    pub async fn set_partitioned(&self, node: impl Into<Arc<str>>, partitioned: bool) {
        let node = node.into();
        let mut set = self.partitioned.lock().await;
        if partitioned {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }
}

/// One node's handle into a `LocalCluster`.
#[derive(Clone)]
pub struct LocalTransport<Msg> {
    node: Arc<str>,
    registry: Arc<Mutex<Registry<Msg>>>,
    partitioned: Arc<Mutex<HashSet<Arc<str>>>>,
}

#[async_trait]
impl<Msg> PubSub for LocalTransport<Msg>
where
    Msg: Clone + Send + Sync + 'static,
{
    type Message = Msg;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Msg>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().await;
        registry
            .entry(topic.to_string())
            .or_default()
            .entry(self.node.clone())
            .or_default()
            .push(tx);
        trace!(node = %self.node, topic, "subscribed");
        Ok(rx)
    }

    async fn broadcast_from(&self, publisher: &str, topic: &str, msg: Msg) -> Result<(), TransportError> {
        let partitioned = self.partitioned.lock().await;
        if partitioned.contains(publisher) {
            return Ok(());
        }
        let mut registry = self.registry.lock().await;
        let Some(nodes) = registry.get_mut(topic) else {
            return Ok(());
        };
        for (node, senders) in nodes.iter_mut() {
            if node.as_ref() == publisher || partitioned.contains(node.as_ref()) {
                continue;
            }
            senders.retain(|tx| tx.send(msg.clone()).is_ok());
        }
        Ok(())
    }

    async fn direct_broadcast(&self, node: &str, topic: &str, msg: Msg) -> Result<(), TransportError> {
        let partitioned = self.partitioned.lock().await;
        if partitioned.contains(self.node.as_ref()) || partitioned.contains(node) {
            return Ok(());
        }
        let mut registry = self.registry.lock().await;
        let senders = registry
            .get_mut(topic)
            .and_then(|nodes| nodes.get_mut(node))
            .ok_or_else(|| TransportError::UnknownNode(node.to_string()))?;
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
        Ok(())
    }

    fn node_name(&self) -> &str {
        &self.node
    }
}
