//! Shared scaffolding for the scenario tests: a diff handler that records
//! everything it sees so assertions can inspect history, plus small
//! polling helpers (`LocalTransport` has no real latency, but convergence
//! still takes a few heartbeat ticks).

use async_trait::async_trait;
use presence_crdt::Diff;
use presence_transport::LocalCluster;
use presence_tracker::{DiffHandler, TrackerConfig, TrackerHandle, TrackerServer, WireMessage};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use presence_crdt::Meta;

#[derive(Clone, Default)]
pub struct DiffLog {
    diffs: Arc<Mutex<Vec<Diff<String>>>>,
}

impl DiffLog {
    pub fn snapshot(&self) -> Vec<Diff<String>> {
        self.diffs.lock().unwrap().clone()
    }
}

struct RecordingHandler {
    log: DiffLog,
}

#[async_trait]
impl DiffHandler<String> for RecordingHandler {
    async fn handle_diff(&mut self, diff: Diff<String>) -> Result<(), String> {
        self.log.diffs.lock().unwrap().push(diff);
        Ok(())
    }
}

pub fn spawn_recording_node(
    cluster: &LocalCluster<WireMessage<String>>,
    node: &str,
    namespace: &str,
    config: TrackerConfig,
) -> (TrackerHandle<String>, DiffLog) {
    let log = DiffLog::default();
    let handler = RecordingHandler { log: log.clone() };
    let (handle, _join) = TrackerServer::spawn(config, namespace, cluster.node(node), handler).unwrap();
    (handle, log)
}

pub fn meta_with(key: &str, value: impl Into<serde_json::Value>) -> Meta {
    let mut m = Meta::new();
    m.insert(key.to_string(), value.into());
    m
}

/// Poll `predicate` until it's true or `timeout` elapses, sleeping briefly
/// between checks. Panics with a clear message on timeout so a failure
/// reads as "convergence didn't happen" rather than a plain assertion.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
