//! End-to-end scenarios (S1-S6) exercising two or three `TrackerServer`s
//! wired through one `LocalTransport` cluster. Unit-level CRDT laws and
//! registry transition tables live in `presence-crdt` and
//! `presence-tracker` themselves; this crate only covers cross-replica
//! convergence behavior.

pub mod support;

#[cfg(test)]
mod scenarios {
    use crate::support::*;
    use presence_crdt::Pid;
    use presence_transport::LocalCluster;
    use presence_tracker::{TrackerConfig, WireMessage};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            broadcast_period: Duration::from_millis(30),
            max_silent_periods: 10,
            down_period: Duration::from_millis(200),
            permdown_period: Duration::from_millis(1500),
            clock_sample_periods: 2,
            log_level: tracing::Level::WARN,
        }
    }

    #[tokio::test]
    async fn s1_solo_join_leave() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let (a, a_diffs) = spawn_recording_node(&cluster, "a", "room", fast_config());

        let (_tx, rx) = oneshot::channel();
        let ref1 = a
            .track(Pid(1), "room", "u1".to_string(), meta_with("status", "on"), rx)
            .await
            .unwrap();
        assert!(ref1.get("phx_ref").is_some());
        assert_eq!(a.list("room").await.unwrap(), vec![("u1".to_string(), ref1.clone())]);

        a.untrack(Pid(1), "room", "u1".to_string()).await.unwrap();
        assert!(a.list("room").await.unwrap().is_empty());

        let diffs = a_diffs.snapshot();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].topics["room"].joins.len(), 1);
        assert_eq!(diffs[1].topics["room"].leaves.len(), 1);
    }

    #[tokio::test]
    async fn s2_two_node_convergence() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let config = fast_config();
        let (a, _a_diffs) = spawn_recording_node(&cluster, "a", "room", config.clone());
        let (b, b_diffs) = spawn_recording_node(&cluster, "b", "room", config.clone());

        let (_tx, rx) = oneshot::channel();
        a.track(Pid(1), "room", "u1".to_string(), Meta::new(), rx)
            .await
            .unwrap();

        wait_until(config.broadcast_period * 6, || {
            b_diffs.snapshot().iter().any(|d| d.topics.contains_key("room"))
        })
        .await;

        let listed = b.list("room").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "u1");
    }

    #[tokio::test]
    async fn s3_metadata_update_emits_single_diff() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let (a, a_diffs) = spawn_recording_node(&cluster, "a", "room", fast_config());

        let (_tx, rx) = oneshot::channel();
        let ref1 = a
            .track(Pid(1), "room", "u1".to_string(), meta_with("n", 1), rx)
            .await
            .unwrap();

        let ref2 = a
            .update(Pid(1), "room", "u1".to_string(), meta_with("n", 2))
            .await
            .unwrap();
        assert_eq!(ref2.get("phx_ref_prev"), ref1.get("phx_ref"));

        let diffs = a_diffs.snapshot();
        let last = diffs.last().unwrap();
        let topic_diff = &last.topics["room"];
        assert_eq!(topic_diff.joins, vec![("u1".to_string(), ref2)]);
        assert_eq!(topic_diff.leaves, vec![("u1".to_string(), ref1)]);
    }

    #[tokio::test]
    async fn s4_peer_restart_purges_old_identity_and_admits_new() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let config = fast_config();
        let (a, a_diffs) = spawn_recording_node(&cluster, "a", "room", config.clone());

        let (b1, _b1_diffs) = spawn_recording_node(&cluster, "b", "room", config.clone());
        let (_tx1, rx1) = oneshot::channel();
        b1.track(Pid(1), "room", "u2".to_string(), Meta::new(), rx1)
            .await
            .unwrap();

        wait_until(config.broadcast_period * 6, || {
            a_diffs.snapshot().iter().any(|d| {
                d.topics
                    .get("room")
                    .map_or(false, |t| t.joins.iter().any(|(k, _)| k == "u2"))
            })
        })
        .await;
        assert_eq!(a.list("room").await.unwrap().len(), 1);

        // "b" restarts: the old handle is dropped (its mailbox closes and
        // its task stops broadcasting) and a fresh tracker takes the same
        // node name with a new, randomly chosen vsn.
        drop(b1);
        tokio::time::sleep(config.broadcast_period * 2).await;

        let (b2, _b2_diffs) = spawn_recording_node(&cluster, "b", "room", config.clone());
        let (_tx2, rx2) = oneshot::channel();
        b2.track(Pid(1), "room", "u3".to_string(), Meta::new(), rx2)
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + config.broadcast_period * 8;
        loop {
            let listed = a.list("room").await.unwrap();
            if listed.len() == 1 && listed[0].0 == "u3" {
                break;
            }
            if std::time::Instant::now() >= deadline {
                panic!("a did not converge on b's new identity: {listed:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn s5_partition_then_recovery_reappears_without_transfer() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let config = fast_config();
        let (a, a_diffs) = spawn_recording_node(&cluster, "a", "room", config.clone());
        let (b, _b_diffs) = spawn_recording_node(&cluster, "b", "room", config.clone());

        let (_tx_a, rx_a) = oneshot::channel();
        a.track(Pid(1), "room", "ua".to_string(), Meta::new(), rx_a)
            .await
            .unwrap();
        let (_tx_b, rx_b) = oneshot::channel();
        b.track(Pid(1), "room", "ub".to_string(), Meta::new(), rx_b)
            .await
            .unwrap();

        wait_until(config.broadcast_period * 6, || {
            a_diffs.snapshot().iter().any(|d| {
                d.topics
                    .get("room")
                    .map_or(false, |t| t.joins.iter().any(|(k, _)| k == "ub"))
            })
        })
        .await;
        assert_eq!(a.list("room").await.unwrap().len(), 2);

        // Sever "b" from the rest of the cluster. "a" stops hearing
        // heartbeats from "b" and, after `down_period`, flags it down and
        // hides its entries; "b" keeps running but can't be reached.
        cluster.set_partitioned("b", true).await;
        tokio::time::sleep(config.down_period + config.broadcast_period * 4).await;

        let listed = a.list("room").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "ua");
        let replicas = a.replicas().await.unwrap();
        let b_record = replicas.iter().find(|r| r.name.as_ref() == "b");
        assert!(b_record.map_or(true, |r| r.status != presence_tracker::ReplicaStatus::Up));

        // Heal the partition well before permdown_period: "b"'s heartbeats
        // resume with the *same* vsn, so "a" simply flips it back to `Up`
        // and its already-converged entries reappear without any transfer.
        cluster.set_partitioned("b", false).await;

        let deadline = std::time::Instant::now() + config.broadcast_period * 8;
        loop {
            let listed = a.list("room").await.unwrap();
            if listed.len() == 2 {
                break;
            }
            if std::time::Instant::now() >= deadline {
                panic!("a did not re-admit b's entries after the partition healed: {listed:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn s6_transfer_on_divergence() {
        let cluster: LocalCluster<WireMessage<String>> = LocalCluster::new();
        let config = fast_config();
        let (a, _a_diffs) = spawn_recording_node(&cluster, "a", "room", config.clone());
        let (c, _c_diffs) = spawn_recording_node(&cluster, "c", "room", config.clone());

        // "b" joins late and partitioned, so its own heartbeats never reach
        // "a"/"c" while they accumulate entries it has never seen.
        let (b, b_diffs) = spawn_recording_node(&cluster, "b", "room", config.clone());
        cluster.set_partitioned("b", true).await;

        let (_tx_a, rx_a) = oneshot::channel();
        a.track(Pid(1), "room", "ua".to_string(), Meta::new(), rx_a)
            .await
            .unwrap();
        let (_tx_c, rx_c) = oneshot::channel();
        c.track(Pid(2), "room", "uc".to_string(), Meta::new(), rx_c)
            .await
            .unwrap();

        // Let "a" and "c" converge with each other while "b" stays cut off.
        tokio::time::sleep(config.broadcast_period * 6).await;

        // Heal the partition: "b" starts hearing heartbeats from "a" and
        // "c" whose clocks dominate its own, issues a `TransferReq`, and
        // should converge on both entries within a few clock-sample
        // periods without either "a" or "c" needing to re-broadcast a join.
        cluster.set_partitioned("b", false).await;

        let deadline =
            std::time::Instant::now() + config.broadcast_period * (config.clock_sample_periods + 4) * 4;
        loop {
            let listed = b.list("room").await.unwrap();
            let mut keys: Vec<_> = listed.iter().map(|(k, _)| k.clone()).collect();
            keys.sort();
            if keys == vec!["ua".to_string(), "uc".to_string()] {
                break;
            }
            if std::time::Instant::now() >= deadline {
                panic!("b never caught up via transfer: {listed:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let diffs = b_diffs.snapshot();
        let joined_keys: std::collections::BTreeSet<_> = diffs
            .iter()
            .filter_map(|d| d.topics.get("room"))
            .flat_map(|t| t.joins.iter().map(|(k, _)| k.clone()))
            .collect();
        assert!(joined_keys.contains("ua"));
        assert!(joined_keys.contains("uc"));
    }
}
