use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::protocol::WireMessage;
use crate::registry::{ReplicaRecord, ReplicaRegistry, ReplicaStatus};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use presence_clock::{PendingClockSet, ReplicaClock, ReplicaRef, VectorClock};
use presence_crdt::{Diff, Meta, Pid, PresenceKey, PresenceState, SyncPayload};
use presence_transport::PubSub;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

/// The application-supplied callback contract. A failure (`Err`) is fatal
/// to the server, per the handler contract: any return other than success
/// crashes the tracker with a descriptive error.
#[async_trait]
pub trait DiffHandler<K: PresenceKey>: Send + 'static {
    async fn handle_diff(&mut self, diff: Diff<K>) -> std::result::Result<(), String>;
}

enum Command<K: PresenceKey> {
    Track {
        pid: Pid,
        topic: String,
        key: K,
        meta: Meta,
        death_watch: oneshot::Receiver<()>,
        reply: oneshot::Sender<Meta>,
    },
    UntrackKey {
        pid: Pid,
        topic: String,
        key: K,
        reply: oneshot::Sender<()>,
    },
    UntrackPid {
        pid: Pid,
        reply: oneshot::Sender<()>,
    },
    Update {
        pid: Pid,
        topic: String,
        key: K,
        meta: Meta,
        reply: oneshot::Sender<Result<Meta>>,
    },
    List {
        topic: String,
        reply: oneshot::Sender<Vec<(K, Meta)>>,
    },
    Replicas {
        reply: oneshot::Sender<Vec<ReplicaRecord>>,
    },
}

/// A cheap, cloneable handle to a running `TrackerServer`. Every call sends
/// a request to the server's mailbox and awaits its reply; the server
/// itself never runs on the caller's task.
pub struct TrackerHandle<K: PresenceKey> {
    sender: mpsc::Sender<Command<K>>,
}

impl<K: PresenceKey> Clone for TrackerHandle<K> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K: PresenceKey> TrackerHandle<K> {
    /// Track `(topic, key, meta)` under `pid`. `death_watch` resolves (or
    /// its sender drops) when the tracked session ends; the server treats
    /// that as an implicit `untrack(pid)`. Returns `meta` augmented with a
    /// fresh `phx_ref`.
    pub async fn track(
        &self,
        pid: Pid,
        topic: impl Into<String>,
        key: K,
        meta: Meta,
        death_watch: oneshot::Receiver<()>,
    ) -> Result<Meta> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Track {
                pid,
                topic: topic.into(),
                key,
                meta,
                death_watch,
                reply,
            })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)
    }

    pub async fn untrack(&self, pid: Pid, topic: impl Into<String>, key: K) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::UntrackKey {
                pid,
                topic: topic.into(),
                key,
                reply,
            })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)
    }

    pub async fn untrack_all(&self, pid: Pid) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::UntrackPid { pid, reply })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)
    }

    pub async fn update(&self, pid: Pid, topic: impl Into<String>, key: K, meta: Meta) -> Result<Meta> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Update {
                pid,
                topic: topic.into(),
                key,
                meta,
                reply,
            })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)?
    }

    pub async fn list(&self, topic: impl Into<String>) -> Result<Vec<(K, Meta)>> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::List {
                topic: topic.into(),
                reply,
            })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)
    }

    pub async fn replicas(&self) -> Result<Vec<ReplicaRecord>> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(Command::Replicas { reply })
            .await
            .map_err(|_| TrackerError::ServerGone)?;
        reply_rx.await.map_err(|_| TrackerError::ServerGone)
    }
}

type DeathWatch = Pin<Box<dyn Future<Output = Pid> + Send>>;

fn death_watch_future(pid: Pid, rx: oneshot::Receiver<()>) -> DeathWatch {
    Box::pin(async move {
        let _ = rx.await;
        pid
    })
}

/// The single-task actor driving one namespace's replication. All state
/// transitions (local calls, the heartbeat timer, inbound wire messages)
/// are serialized through `run`'s `select!` loop; nothing here is shared
/// across tasks.
pub struct TrackerServer<K, T, H>
where
    K: PresenceKey,
    T: PubSub<Message = WireMessage<K>>,
    H: DiffHandler<K>,
{
    config: TrackerConfig,
    topic: String,
    self_ref: ReplicaRef,
    transport: T,
    handler: H,
    crdt: PresenceState<K>,
    registry: ReplicaRegistry,
    pending_clocks: PendingClockSet,
    silent_periods: u32,
    current_sample_count: u32,
    mailbox: mpsc::Receiver<Command<K>>,
    inbound: mpsc::UnboundedReceiver<WireMessage<K>>,
    watched_pids: std::collections::BTreeSet<Pid>,
    death_watches: FuturesUnordered<DeathWatch>,
}

impl<K, T, H> TrackerServer<K, T, H>
where
    K: PresenceKey,
    T: PubSub<Message = WireMessage<K>> + Send + Sync + 'static,
    H: DiffHandler<K>,
{
    /// Start a tracker server for `server_name` on `transport`, returning a
    /// handle for local callers and the task's `JoinHandle`.
    pub fn spawn(
        config: TrackerConfig,
        server_name: impl Into<String>,
        transport: T,
        handler: H,
    ) -> Result<(TrackerHandle<K>, tokio::task::JoinHandle<Result<()>>)> {
        config.validate()?;
        let server_name = server_name.into();
        let topic = format!("phx_presence:{server_name}");
        let self_ref = ReplicaRef::new(transport.node_name().to_string(), rand::random());
        let (mailbox_tx, mailbox_rx) = mpsc::channel(1024);
        let crdt = PresenceState::new(self_ref.clone());

        let join = tokio::spawn(async move {
            // Subscribe before the stutter delay: a peer's heartbeat or
            // transfer_req arriving during the jitter window must still
            // find a registered subscriber, or it's silently dropped.
            let inbound = transport.subscribe(&topic).await?;

            let stutter_ms = {
                let quarter = (config.broadcast_period.as_millis() as u64 / 4).max(1);
                rand::thread_rng().gen_range(0..=quarter)
            };
            tokio::time::sleep(Duration::from_millis(stutter_ms)).await;

            let server = TrackerServer {
                config,
                topic,
                self_ref,
                transport,
                handler,
                crdt,
                registry: ReplicaRegistry::new(),
                pending_clocks: PendingClockSet::new(),
                silent_periods: 0,
                current_sample_count: 1,
                mailbox: mailbox_rx,
                inbound,
                watched_pids: std::collections::BTreeSet::new(),
                death_watches: FuturesUnordered::new(),
            };
            server.run().await
        });

        Ok((TrackerHandle { sender: mailbox_tx }, join))
    }

    async fn run(mut self) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.broadcast_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.current_sample_count = self.config.clock_sample_periods.max(1);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.on_heartbeat_tick().await?;
                }
                maybe_msg = self.inbound.recv() => {
                    match maybe_msg {
                        Some(msg) => self.on_inbound(msg).await?,
                        None => {
                            warn!(topic = %self.topic, "transport subscription closed, stopping tracker");
                            return Ok(());
                        }
                    }
                }
                maybe_cmd = self.mailbox.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.on_command(cmd).await?,
                        None => {
                            debug!(topic = %self.topic, "last handle dropped, stopping tracker");
                            return Ok(());
                        }
                    }
                }
                Some(pid) = self.death_watches.next(), if !self.death_watches.is_empty() => {
                    self.on_session_down(pid).await?;
                }
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(topic = %self.topic))]
    async fn on_command(&mut self, cmd: Command<K>) -> Result<()> {
        match cmd {
            Command::Track {
                pid,
                topic,
                key,
                meta,
                death_watch,
                reply,
            } => {
                let (_, joined_meta) = self.crdt.join(pid, topic.clone(), key.clone(), meta);
                if self.watched_pids.insert(pid) {
                    self.death_watches.push(death_watch_future(pid, death_watch));
                }
                let mut diff = Diff::new();
                diff.push_join(topic, key, joined_meta.clone());
                self.report_diff(diff).await?;
                let _ = reply.send(joined_meta);
            }
            Command::UntrackKey { pid, topic, key, reply } => {
                if let Some((key, meta)) = self.crdt.leave_key(pid, &topic, &key) {
                    let mut diff = Diff::new();
                    diff.push_leave(topic, key, meta);
                    self.report_diff(diff).await?;
                }
                if self.crdt.get_by_pid(pid).is_empty() {
                    self.watched_pids.remove(&pid);
                }
                let _ = reply.send(());
            }
            Command::UntrackPid { pid, reply } => {
                self.untrack_pid(pid).await?;
                let _ = reply.send(());
            }
            Command::Update {
                pid,
                topic,
                key,
                meta,
                reply,
            } => {
                let result = self.do_update(pid, topic, key, meta).await;
                let _ = reply.send(result);
            }
            Command::List { topic, reply } => {
                let _ = reply.send(self.crdt.get_by_topic(&topic));
            }
            Command::Replicas { reply } => {
                let _ = reply.send(self.registry.iter().cloned().collect());
            }
        }
        Ok(())
    }

    async fn do_update(&mut self, pid: Pid, topic: String, key: K, mut new_meta: Meta) -> Result<Meta> {
        let Some(old_meta) = self.crdt.get_by_pid_topic_key(pid, &topic, &key) else {
            return Err(TrackerError::NoPresence);
        };
        let old_ref = old_meta.get(presence_crdt::PHX_REF).cloned();
        self.crdt.leave_key(pid, &topic, &key);
        if let Some(old_ref) = old_ref {
            new_meta.insert(presence_crdt::PHX_REF_PREV.to_string(), old_ref);
        }
        let (_, joined_meta) = self.crdt.join(pid, topic.clone(), key.clone(), new_meta);

        let mut diff = Diff::new();
        diff.push_join(topic.clone(), key.clone(), joined_meta.clone());
        diff.push_leave(topic, key, old_meta);
        self.report_diff(diff).await?;
        Ok(joined_meta)
    }

    async fn untrack_pid(&mut self, pid: Pid) -> Result<()> {
        self.watched_pids.remove(&pid);
        let removed = self.crdt.leave_pid(pid);
        if removed.is_empty() {
            return Ok(());
        }
        let mut diff = Diff::new();
        for (topic, key, meta) in removed {
            diff.push_leave(topic, key, meta);
        }
        self.report_diff(diff).await
    }

    async fn on_session_down(&mut self, pid: Pid) -> Result<()> {
        // The session's own death dropped the watch; no link to detach.
        self.untrack_pid(pid).await
    }

    #[instrument(level = "debug", skip(self), fields(topic = %self.topic))]
    async fn on_heartbeat_tick(&mut self) -> Result<()> {
        self.broadcast_phase().await?;
        self.sync_phase().await?;
        self.liveness_phase().await?;
        Ok(())
    }

    async fn broadcast_phase(&mut self) -> Result<()> {
        if self.crdt.has_delta() {
            let delta = self.crdt.extract_delta();
            self.crdt.reset_delta();
            self.send_heartbeat(delta).await?;
            self.silent_periods = 0;
        } else if self.silent_periods >= self.config.max_silent_periods {
            let delta = self.crdt.extract_delta();
            self.send_heartbeat(delta).await?;
            self.silent_periods = 0;
        } else {
            self.silent_periods += 1;
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self, delta: presence_crdt::PresenceDelta<K>) -> Result<()> {
        let msg = WireMessage::Heartbeat {
            from: self.self_ref.clone(),
            delta,
        };
        self.transport
            .broadcast_from(self.transport.node_name(), &self.topic, msg)
            .await?;
        Ok(())
    }

    async fn sync_phase(&mut self) -> Result<()> {
        self.current_sample_count = self.current_sample_count.saturating_sub(1);
        if self.current_sample_count > 1 {
            return Ok(());
        }

        let clocks = self.crdt.clocks();
        self.pending_clocks.record(&clocks);
        let local_clock: VectorClock = clocks
            .get(self.self_ref.name.as_ref())
            .map(|c: &ReplicaClock| c.vector_clock.clone())
            .unwrap_or_default();

        let candidates = self.pending_clocks.divergent_peers(&local_clock);
        self.pending_clocks.clear();
        self.current_sample_count = self.config.clock_sample_periods.max(1);

        for replica in candidates {
            if self.registry.contains(&replica.name) {
                self.send_transfer_req(&replica).await?;
            }
        }
        Ok(())
    }

    async fn send_transfer_req(&mut self, to: &ReplicaRef) -> Result<()> {
        let xfer_ref = format!("{:x}{:x}", rand::random::<u64>(), self.self_ref.vsn);
        let msg = WireMessage::TransferReq {
            xfer_ref,
            from: self.self_ref.clone(),
        };
        self.transport.direct_broadcast(&to.name, &self.topic, msg).await?;
        Ok(())
    }

    async fn liveness_phase(&mut self) -> Result<()> {
        let names: Vec<_> = self.registry.names().cloned().collect();
        let now = Instant::now();
        for name in names {
            let Some((prev, current)) =
                self.registry
                    .detect_down(&name, self.config.down_period, self.config.permdown_period, now)
            else {
                continue;
            };
            if prev.status == current.status {
                continue;
            }
            match (prev.status, current.status) {
                (ReplicaStatus::Up, ReplicaStatus::Down) => {
                    info!(replica = %current.replica_ref(), "replica flagged down");
                    let diff = self.crdt.replica_down(&current.replica_ref());
                    self.report_diff(diff).await?;
                }
                (ReplicaStatus::Down, ReplicaStatus::Permdown) => {
                    info!(replica = %prev.replica_ref(), "replica flagged permdown");
                    self.crdt.remove_down_replicas(&prev.replica_ref());
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn on_inbound(&mut self, msg: WireMessage<K>) -> Result<()> {
        match msg {
            WireMessage::Heartbeat { from, delta } => {
                self.pending_clocks.record(&delta.clocks);
                let mut diff = if delta.is_empty() {
                    Diff::new()
                } else {
                    self.crdt.merge(SyncPayload::Delta(delta))
                };

                let now = Instant::now();
                let (prev, current) = self.registry.put_heartbeat(from.name.clone(), from.vsn, now);
                self.apply_heartbeat_transition(prev, &current, &mut diff);
                self.report_diff(diff).await?;
            }
            WireMessage::TransferReq { xfer_ref, from } => {
                let snapshot = self.crdt.extract();
                let msg = WireMessage::TransferAck {
                    xfer_ref,
                    from: self.self_ref.clone(),
                    snapshot,
                };
                self.transport.direct_broadcast(&from.name, &self.topic, msg).await?;
            }
            WireMessage::TransferAck { snapshot, .. } => {
                let diff = self.crdt.merge(snapshot);
                self.report_diff(diff).await?;
            }
        }
        Ok(())
    }

    /// Apply the `(prev, current)` transition table from `put_heartbeat`,
    /// folding any resulting joins/leaves into `diff`.
    fn apply_heartbeat_transition(
        &mut self,
        prev: Option<ReplicaRecord>,
        current: &ReplicaRecord,
        diff: &mut Diff<K>,
    ) {
        match prev {
            None => {
                diff.merge(self.crdt.replica_up(&current.replica_ref()));
            }
            Some(prev) if prev.vsn == current.vsn => {
                if prev.status != ReplicaStatus::Up {
                    diff.merge(self.crdt.replica_up(&current.replica_ref()));
                }
            }
            Some(prev) => {
                let old_ref = prev.replica_ref();
                debug!(old = %old_ref, new = %current.replica_ref(), "peer restart detected (vsn changed)");
                if prev.status == ReplicaStatus::Up {
                    diff.merge(self.crdt.replica_down(&old_ref));
                }
                self.crdt.remove_down_replicas(&old_ref);
                diff.merge(self.crdt.replica_up(&current.replica_ref()));
            }
        }
    }

    async fn report_diff(&mut self, diff: Diff<K>) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }
        self.handler
            .handle_diff(diff)
            .await
            .map_err(TrackerError::HandlerContractViolation)
    }
}
