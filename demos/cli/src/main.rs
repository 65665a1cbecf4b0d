//! Worked example of the S1/S2 scenarios: two in-process tracker replicas,
//! "alice" and "bob", share one `LocalCluster` transport. Alice tracks a
//! presence; bob's diff handler prints what it observes once the heartbeat
//! carries it across.

use async_trait::async_trait;
use clap::Parser;
use presence_crdt::{Diff, Meta, Pid};
use presence_transport::LocalCluster;
use presence_tracker::{TrackerConfig, TrackerServer, WireMessage};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// Namespace for the tracker servers (topic becomes "phx_presence:<namespace>").
    #[arg(long, default_value = "room")]
    namespace: String,

    /// How long to let the demo run before exiting.
    #[arg(long, default_value_t = 3000)]
    wait_ms: u64,
}

struct PrintlnDiffHandler {
    node: &'static str,
}

#[async_trait]
impl presence_tracker::DiffHandler<String> for PrintlnDiffHandler {
    async fn handle_diff(&mut self, diff: Diff<String>) -> Result<(), String> {
        for (topic, topic_diff) in diff.topics {
            for (key, meta) in topic_diff.joins {
                println!("[{}] join  {}/{} meta={:?}", self.node, topic, key, meta);
            }
            for (key, meta) in topic_diff.leaves {
                println!("[{}] leave {}/{} meta={:?}", self.node, topic, key, meta);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();

    let mut config = TrackerConfig::default();
    config.broadcast_period = Duration::from_millis(200);
    config.down_period = Duration::from_millis(2000);
    config.permdown_period = Duration::from_millis(10_000);

    let (alice, _alice_join) = TrackerServer::spawn(
        config.clone(),
        args.namespace.clone(),
        cluster.node("alice"),
        PrintlnDiffHandler { node: "alice" },
    )?;
    let (bob, _bob_join) = TrackerServer::spawn(
        config,
        args.namespace.clone(),
        cluster.node("bob"),
        PrintlnDiffHandler { node: "bob" },
    )?;

    let (_watch_tx, watch_rx) = oneshot::channel();
    let mut meta = Meta::new();
    meta.insert("status".to_string(), serde_json::json!("online"));
    let joined = alice.track(Pid(1), "lobby", "u1".to_string(), meta, watch_rx).await?;
    println!("alice tracked u1 with phx_ref={:?}", joined.get("phx_ref"));

    tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;

    let seen_on_bob = bob.list("lobby").await?;
    println!("bob now lists lobby: {:?}", seen_on_bob);

    Ok(())
}
