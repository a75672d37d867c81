//! Replication domain: one replicated base DN on one replica.
//!
//! A [`ReplicationDomain`] turns local changes into CSN-stamped updates,
//! replays the updates its replication server relays from other replicas,
//! and keeps the session with that server alive. Local and remote writes go
//! through the same [`ReplayEngine`], so replicas that saw the same changes
//! hold the same data.
//!
//! A session runs three tasks: a writer draining the outbox, a pump sending
//! local changes from the outbound changelog within the send window, and the
//! reader loop, which also drives heartbeats and admin commands.
//!
//! With several replication servers configured, each is asked for its
//! [`ServerInfo`] first and the session goes to the one
//! [`best_server`] picks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{KvBackend, KvPair};
use crate::changelog::{ChangelogCursor, ChangelogRecord, ChangelogStore};
use crate::config::DomainConfig;
use crate::conflict_resolver::ConflictRecord;
use crate::csn::{Csn, CsnGenerator, ServerId};
use crate::dn::Dn;
use crate::entry_store::{DirectoryEntry, EntryStore, StoredEntry};
use crate::error::{ReplError, Result};
use crate::flow::{RecvWindow, SendWindow};
use crate::generation;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatState};
use crate::monitor::DomainMonitor;
use crate::protocol::{
    AdminCommand, AssuredAck, AssuredMode, Handshake, ServerInfo, SessionMsg, PROTOCOL_VERSION,
};
use crate::replay::{ReplayEngine, ReplayOutcome};
use crate::retry::{Backoff, RetryExecutor, RetryOutcome};
use crate::selection::{best_server, LocalView};
use crate::server_state::{ReplicaId, ServerState};
use crate::session::{drain_outbox, enqueue, Connector, Link, LinkReceiver, OUTBOX_CAPACITY};
use crate::status::{ReplicaStatus, StatusChange, StatusEvent, StatusMachine, STATUS_CHANNEL_CAPACITY};
use crate::update_msg::{
    normalize_attributes, to_attr_changes, EntryUuid, LocalChange, UpdateMsg, UpdatePayload,
};

const STATE_META: &str = "state";
const ADMIN_CHANNEL_CAPACITY: usize = 16;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Progress of the latest full update requested by this domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullUpdateEvent {
    /// No full update requested yet.
    Idle,
    /// Request sent; entries are being received.
    Started,
    /// Data replaced by a copy of another replica.
    Completed {
        /// Entry store records imported.
        records: usize,
    },
    /// The replication server or the source gave up.
    Failed {
        /// Reason reported.
        reason: String,
    },
}

#[derive(Debug, Default)]
struct DomainCounters {
    published: AtomicU64,
    received: AtomicU64,
    covered: AtomicU64,
    apply_failures: AtomicU64,
    full_updates: AtomicU64,
    sessions: AtomicU64,
    assured_updates: AtomicU64,
    assured_failures: AtomicU64,
}

struct DomainInner {
    config: DomainConfig,
    base_dn: Dn,
    server_id: ServerId,
    generator: CsnGenerator,
    engine: ReplayEngine,
    outbound: ChangelogStore,
    state: Mutex<ServerState>,
    generation_id: AtomicU64,
    // Readers: publish/receive. Writer: snapshot export and import.
    gate: RwLock<()>,
    // Held from CSN generation to the outbound append.
    publish_lock: tokio::sync::Mutex<()>,
    // Oldest update per originating server that failed to apply.
    held_back: Mutex<BTreeMap<ServerId, Csn>>,
    assured: Mutex<HashMap<Csn, oneshot::Sender<AssuredAck>>>,
    status: StatusMachine,
    counters: DomainCounters,
    apply_retry: RetryExecutor,
    cancel: CancellationToken,
    admin_tx: mpsc::Sender<AdminCommand>,
    admin_rx: tokio::sync::Mutex<mpsc::Receiver<AdminCommand>>,
    connected_to: Mutex<Option<String>>,
    apply_degraded: AtomicBool,
    full_update: watch::Sender<FullUpdateEvent>,
}

impl DomainInner {
    /// Message carrying a local change; assured while its publisher waits.
    fn outbound_msg(&self, update: UpdateMsg) -> SessionMsg {
        match self.config.assured {
            Some(mode) if self.assured.lock().contains_key(&update.csn) => {
                SessionMsg::AssuredUpdate { update, mode }
            }
            _ => SessionMsg::Update(update),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
    Lost(String),
    // Ended unacknowledged so the failed update is relayed again.
    ApplyFailed(String),
}

struct SessionCtx {
    server: ServerId,
    outbox: mpsc::Sender<SessionMsg>,
    send_window: SendWindow,
    recv_window: RecvWindow,
    token: CancellationToken,
    pump: Option<(CancellationToken, JoinHandle<()>)>,
    import: Option<Vec<KvPair>>,
}

impl SessionCtx {
    async fn stop_pump(&mut self) {
        if let Some((token, handle)) = self.pump.take() {
            token.cancel();
            let _ = handle.await;
        }
    }
}

/// One replicated base DN on this replica.
#[derive(Clone)]
pub struct ReplicationDomain {
    inner: Arc<DomainInner>,
}

impl ReplicationDomain {
    /// Opens the domain over `backend`, resuming persisted state.
    ///
    /// The backend holds the entries, the domain metadata and the outbound
    /// changelog of this replica.
    pub fn open(config: DomainConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;
        let base_dn = config.base_dn();
        let server_id = config.server_id();
        let store = EntryStore::new(Arc::clone(&backend), base_dn.clone());
        let state: ServerState = store.load_meta(STATE_META)?.unwrap_or_default();
        let generation_id = generation::load_or_init(&store)?;
        let outbound = ChangelogStore::open(backend)?;

        let own = ReplicaId::new(base_dn.clone(), server_id);
        let last_own = [state.max_csn(server_id), outbound.newest(&own)]
            .into_iter()
            .flatten()
            .max();
        let generator = CsnGenerator::resume_after(server_id, last_own);
        for (_, csn) in state.iter() {
            generator.adjust(&csn);
        }

        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CHANNEL_CAPACITY);
        let (full_update, _) = watch::channel(FullUpdateEvent::Idle);
        info!(
            base_dn = %base_dn,
            server_id = %server_id,
            generation_id,
            state = %state,
            "replication domain opened"
        );

        Ok(Self {
            inner: Arc::new(DomainInner {
                apply_retry: RetryExecutor::new(config.apply_retry.clone()),
                engine: ReplayEngine::new(store, config.pending_capacity),
                status: StatusMachine::new(base_dn.clone(), server_id, status_tx),
                config,
                base_dn,
                server_id,
                generator,
                outbound,
                state: Mutex::new(state),
                generation_id: AtomicU64::new(generation_id),
                gate: RwLock::new(()),
                publish_lock: tokio::sync::Mutex::new(()),
                held_back: Mutex::new(BTreeMap::new()),
                assured: Mutex::new(HashMap::new()),
                counters: DomainCounters::default(),
                cancel: CancellationToken::new(),
                admin_tx,
                admin_rx: tokio::sync::Mutex::new(admin_rx),
                connected_to: Mutex::new(None),
                apply_degraded: AtomicBool::new(false),
                full_update,
            }),
        })
    }

    /// Replicated base DN.
    pub fn base_dn(&self) -> &Dn {
        &self.inner.base_dn
    }

    /// Server ID of this replica.
    pub fn server_id(&self) -> ServerId {
        self.inner.server_id
    }

    /// Current status.
    pub fn status(&self) -> ReplicaStatus {
        self.inner.status.status()
    }

    /// Status transitions from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status.subscribe()
    }

    /// Full update progress.
    pub fn subscribe_full_updates(&self) -> watch::Receiver<FullUpdateEvent> {
        self.inner.full_update.subscribe()
    }

    /// Everything applied on this replica.
    pub fn server_state(&self) -> ServerState {
        self.inner.state.lock().clone()
    }

    /// Generation ID of the local data.
    pub fn generation_id(&self) -> u64 {
        self.inner.generation_id.load(Ordering::SeqCst)
    }

    /// Entry store of the domain.
    pub fn store(&self) -> &EntryStore {
        self.inner.engine.store()
    }

    /// Entry currently placed at `dn`.
    pub fn find(&self, dn: &Dn) -> Result<Option<DirectoryEntry>> {
        self.store().find(dn)
    }

    /// Every live entry.
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        self.store().entries()
    }

    /// Recently resolved conflicts.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.engine.resolver().recent()
    }

    /// Cancelled when the domain shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn set_status(&self, event: StatusEvent) {
        if let Err(e) = self.inner.status.apply(event) {
            debug!(base_dn = %self.inner.base_dn, error = %e, "status event ignored");
        }
    }

    fn resolve(&self, dn: &Dn) -> Result<EntryUuid> {
        self.store()
            .lookup_dn(dn)?
            .ok_or_else(|| ReplError::NoSuchEntry {
                target: dn.to_string(),
            })
    }

    fn check_within(&self, dn: &Dn) -> Result<()> {
        if dn.is_within(&self.inner.base_dn) {
            Ok(())
        } else {
            Err(ReplError::NoSuchEntry {
                target: dn.to_string(),
            })
        }
    }

    fn ensure_free(&self, dn: &Dn) -> Result<()> {
        match self.store().lookup_dn(dn)? {
            Some(_) => Err(ReplError::EntryAlreadyExists { dn: dn.to_string() }),
            None => Ok(()),
        }
    }

    /// Advances the state with `csn` and persists it.
    fn advance_state(&self, csn: &Csn) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.update(csn) {
            self.store().store_meta(STATE_META, &*state)?;
        }
        Ok(())
    }

    /// Applies a local change and queues it for replication.
    ///
    /// Returns the CSN assigned to the change. In assured mode the call
    /// then waits for the replication server's acknowledgment, up to the
    /// assured timeout; a late or failed acknowledgment is counted and
    /// logged but does not undo the change.
    pub async fn publish(&self, change: LocalChange) -> Result<Csn> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        self.check_within(change.dn())?;

        let (csn, waiting) = {
            let _gate = inner.gate.read().await;
            let _publishing = inner.publish_lock.lock().await;

            let uuid = match &change {
                LocalChange::Add { dn, .. } => {
                    self.ensure_free(dn)?;
                    EntryUuid::new_v4()
                }
                LocalChange::Rename { dn, new_dn } => {
                    self.check_within(new_dn)?;
                    if new_dn != dn {
                        self.ensure_free(new_dn)?;
                    }
                    self.resolve(dn)?
                }
                other => self.resolve(other.dn())?,
            };
            let csn = inner.generator.new_csn();
            let (msg, outcome) = inner
                .engine
                .apply_built(uuid, |current| stamp(&change, uuid, csn, current))
                .await?;
            self.advance_state(&msg.csn)?;

            // Registered before the pump can see the record.
            let waiting = inner.config.assured.map(|mode| {
                let (tx, rx) = oneshot::channel();
                inner.assured.lock().insert(msg.csn, tx);
                (mode, rx)
            });
            if let Err(e) = self.record_outbound(&msg) {
                inner.assured.lock().remove(&msg.csn);
                error!(
                    base_dn = %inner.base_dn,
                    csn = %msg.csn,
                    error = %e,
                    "local change applied but not recorded for replication"
                );
                return Err(e);
            }
            inner.counters.published.fetch_add(1, Ordering::Relaxed);
            debug!(
                base_dn = %inner.base_dn,
                csn = %msg.csn,
                entry_uuid = %msg.entry_uuid,
                kind = %msg.kind(),
                outcome = ?outcome,
                "local change published"
            );
            (msg.csn, waiting)
        };

        if let Some((mode, ack)) = waiting {
            self.await_assured(csn, mode, ack).await;
        }
        Ok(csn)
    }

    fn record_outbound(&self, msg: &UpdateMsg) -> Result<()> {
        let inner = &self.inner;
        let own = ReplicaId::new(inner.base_dn.clone(), inner.server_id);
        let record = ChangelogRecord::new(msg)?;
        if inner.outbound.append(&own, &record)? {
            Ok(())
        } else {
            Err(ReplError::changelog(format!(
                "{} is not newer than the outbound changelog of {own}",
                msg.csn
            )))
        }
    }

    async fn await_assured(&self, csn: Csn, mode: AssuredMode, ack: oneshot::Receiver<AssuredAck>) {
        let inner = &self.inner;
        inner.counters.assured_updates.fetch_add(1, Ordering::Relaxed);
        let answer = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            answer = tokio::time::timeout(inner.config.assured_timeout(), ack) => {
                answer.ok().and_then(|received| received.ok())
            }
        };
        inner.assured.lock().remove(&csn);
        match answer {
            Some(ack) if ack.is_success() => {
                debug!(base_dn = %inner.base_dn, csn = %csn, mode = %mode, "assured update acknowledged");
            }
            Some(ack) => {
                inner.counters.assured_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    base_dn = %inner.base_dn,
                    csn = %csn,
                    mode = %mode,
                    timed_out = ack.timed_out,
                    wrong_status = ack.wrong_status,
                    replay_error = ack.replay_error,
                    failed_servers = ?ack.failed_servers,
                    "assured update not acknowledged by every replica"
                );
            }
            None => {
                inner.counters.assured_failures.fetch_add(1, Ordering::Relaxed);
                warn!(base_dn = %inner.base_dn, csn = %csn, mode = %mode, "assured update acknowledgment timed out");
            }
        }
    }

    /// Replays an update originating from another replica.
    ///
    /// Updates already covered by the server state are dropped. Failures
    /// are retried; when retries run out the domain turns degraded and the
    /// server state stays below the failed update. Until that update is
    /// delivered again and applies, later updates of the same originating
    /// server are refused with [`ReplError::UpdateHeldBack`], so none of
    /// them can move the state past it.
    pub async fn receive(&self, msg: UpdateMsg) -> Result<ReplayOutcome> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        let _gate = inner.gate.read().await;
        inner.counters.received.fetch_add(1, Ordering::Relaxed);
        if inner.state.lock().cover(&msg.csn) {
            inner.counters.covered.fetch_add(1, Ordering::Relaxed);
            debug!(base_dn = %inner.base_dn, csn = %msg.csn, "update already covered");
            return Ok(ReplayOutcome::Dropped);
        }
        let origin = msg.csn.server_id();
        let blocked = inner.held_back.lock().get(&origin).copied();
        if let Some(waiting_for) = blocked.filter(|failed| msg.csn > *failed) {
            debug!(base_dn = %inner.base_dn, csn = %msg.csn, waiting_for = %waiting_for, "update held back");
            return Err(ReplError::UpdateHeldBack {
                csn: msg.csn,
                waiting_for,
            });
        }
        inner.generator.adjust(&msg.csn);

        match inner.apply_retry.execute(|| inner.engine.apply(&msg)).await {
            RetryOutcome::Success(outcome) => {
                self.advance_state(&msg.csn)?;
                {
                    let mut held_back = inner.held_back.lock();
                    if held_back.get(&origin).is_some_and(|failed| *failed <= msg.csn) {
                        held_back.remove(&origin);
                    }
                }
                if inner.apply_degraded.swap(false, Ordering::SeqCst) {
                    info!(base_dn = %inner.base_dn, csn = %msg.csn, "updates apply again");
                    self.set_status(StatusEvent::ToNormal);
                }
                Ok(outcome)
            }
            RetryOutcome::Exhausted {
                last_error: e @ ReplError::ConflictOverflow { .. },
                ..
            } => {
                warn!(
                    base_dn = %inner.base_dn,
                    csn = %msg.csn,
                    error = %e,
                    "pending updates overflowed, full update required"
                );
                let _ = inner.admin_tx.try_send(AdminCommand::ForceResync);
                Err(e)
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                inner.counters.apply_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    base_dn = %inner.base_dn,
                    csn = %msg.csn,
                    entry_uuid = %msg.entry_uuid,
                    attempts,
                    error = %last_error,
                    "update could not be applied"
                );
                inner
                    .held_back
                    .lock()
                    .entry(origin)
                    .and_modify(|failed| *failed = (*failed).min(msg.csn))
                    .or_insert(msg.csn);
                inner.apply_degraded.store(true, Ordering::SeqCst);
                self.set_status(StatusEvent::ToDegraded);
                Err(last_error)
            }
        }
    }

    /// Sends an admin command to the running session.
    pub async fn admin(&self, command: AdminCommand) -> Result<()> {
        self.inner
            .admin_tx
            .send(command)
            .await
            .map_err(|_| ReplError::Shutdown)
    }

    /// Replaces the local data with a copy from another replica.
    ///
    /// Waits until the import finished; returns the number of records
    /// imported. The request is served once a session is established.
    pub async fn resynchronize(&self) -> Result<usize> {
        let mut events = self.inner.full_update.subscribe();
        self.admin(AdminCommand::ForceResync).await?;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(ReplError::Shutdown),
                changed = events.changed() => changed.map_err(|_| ReplError::Shutdown)?,
            }
            let event = events.borrow_and_update().clone();
            match event {
                FullUpdateEvent::Completed { records } => return Ok(records),
                FullUpdateEvent::Failed { reason } => {
                    return Err(ReplError::protocol(format!("full update failed: {reason}")))
                }
                FullUpdateEvent::Idle | FullUpdateEvent::Started => {}
            }
        }
    }

    /// Stops sessions and waits for in-flight changes.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let _gate = self.inner.gate.write().await;
        self.set_status(StatusEvent::ToNotConnected);
        info!(base_dn = %self.inner.base_dn, "replication domain shut down");
    }

    /// Snapshot for operators.
    pub fn monitor(&self) -> Result<DomainMonitor> {
        let inner = &self.inner;
        let stats = inner.engine.stats();
        let counters = &inner.counters;
        Ok(DomainMonitor {
            base_dn: inner.base_dn.clone(),
            server_id: inner.server_id,
            status: self.status(),
            connected_to: inner.connected_to.lock().clone(),
            generation_id: self.generation_id(),
            server_state: self.server_state(),
            pending_updates: inner.engine.pending_len(),
            naming_conflicts: self.store().conflict_count()?,
            conflicts_total: inner.engine.resolver().conflict_count(),
            updates_published: counters.published.load(Ordering::Relaxed),
            updates_received: counters.received.load(Ordering::Relaxed),
            updates_applied: stats.applied + stats.conflicts,
            updates_dropped: stats.dropped + counters.covered.load(Ordering::Relaxed),
            apply_failures: counters.apply_failures.load(Ordering::Relaxed),
            full_updates: counters.full_updates.load(Ordering::Relaxed),
            sessions: counters.sessions.load(Ordering::Relaxed),
            assured_updates: counters.assured_updates.load(Ordering::Relaxed),
            assured_failures: counters.assured_failures.load(Ordering::Relaxed),
        })
    }

    /// Keeps a session with one of the configured replication servers until
    /// the domain shuts down.
    ///
    /// With several servers configured the best one is picked before each
    /// attempt; after a failed attempt the next one in order is tried, after
    /// a backoff delay.
    pub async fn run(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let inner = &self.inner;
        let servers = inner.config.replication_servers.clone();
        if servers.is_empty() {
            return Err(ReplError::Config {
                msg: format!("no replication server configured for {}", inner.base_dn),
            });
        }
        let mut backoff = Backoff::new(inner.config.reconnect.clone());
        let mut next_server = 0usize;
        let mut rotate = false;

        let result = loop {
            if inner.cancel.is_cancelled() {
                break Ok(());
            }
            let mut index = next_server % servers.len();
            if servers.len() > 1 && !rotate {
                let chosen = tokio::select! {
                    _ = inner.cancel.cancelled() => break Ok(()),
                    chosen = self.choose_server(connector.as_ref(), &servers) => chosen,
                };
                index = chosen.unwrap_or(index);
            }
            let addr = servers[index].clone();
            self.set_status(StatusEvent::ToConnecting);
            let connected = tokio::select! {
                _ = inner.cancel.cancelled() => break Ok(()),
                connected = connector.connect(&addr) => connected,
            };
            let end = match connected {
                Ok(link) => {
                    inner.counters.sessions.fetch_add(1, Ordering::Relaxed);
                    *inner.connected_to.lock() = Some(addr.clone());
                    let end = self.run_session(link).await;
                    *inner.connected_to.lock() = None;
                    end
                }
                Err(e) => Err(e),
            };
            self.set_status(StatusEvent::ToNotConnected);

            rotate = false;
            match end {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Reconnect) => {
                    backoff.reset();
                    continue;
                }
                Ok(SessionEnd::Lost(reason)) => {
                    info!(base_dn = %inner.base_dn, server = %addr, reason = %reason, "session ended");
                    backoff.reset();
                }
                Ok(SessionEnd::ApplyFailed(reason)) => {
                    warn!(base_dn = %inner.base_dn, server = %addr, reason = %reason, "session ended on apply failure");
                }
                Err(e) => {
                    warn!(base_dn = %inner.base_dn, server = %addr, error = %e, "session failed");
                    next_server = index + 1;
                    rotate = true;
                }
            }

            let Some(delay) = backoff.next_delay() else {
                break Err(ReplError::Protocol {
                    msg: format!(
                        "gave up connecting after {} attempts",
                        backoff.attempts()
                    ),
                });
            };
            tokio::select! {
                _ = inner.cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };
        self.set_status(StatusEvent::ToNotConnected);
        result
    }

    /// Index of the server to connect to; `None` when none answered.
    async fn choose_server(&self, connector: &dyn Connector, servers: &[String]) -> Option<usize> {
        let inner = &self.inner;
        let mut answered = Vec::new();
        let mut candidates = Vec::new();
        for (index, addr) in servers.iter().enumerate() {
            match self.query_server(connector, addr).await {
                Ok(info) => {
                    answered.push(index);
                    candidates.push(info);
                }
                Err(e) => debug!(base_dn = %inner.base_dn, server = %addr, error = %e, "server info unavailable"),
            }
        }
        let state = self.server_state();
        let local = LocalView {
            server_id: inner.server_id,
            group_id: inner.config.group_id,
            generation_id: self.generation_id(),
            state: &state,
        };
        let chosen = best_server(&candidates, &local)?;
        debug!(
            base_dn = %inner.base_dn,
            server = %servers[answered[chosen]],
            replication_server = %candidates[chosen].server_id,
            candidates = candidates.len(),
            "replication server selected"
        );
        Some(answered[chosen])
    }

    async fn query_server(&self, connector: &dyn Connector, addr: &str) -> Result<ServerInfo> {
        let mut link = connector.connect(addr).await?;
        link.send(&SessionMsg::ServerInfoRequest {
            base_dn: self.inner.base_dn.clone(),
        })
        .await?;
        match link.recv_timeout(self.inner.config.heartbeat().timeout()).await? {
            SessionMsg::ServerInfo(info) => Ok(info),
            other => Err(ReplError::protocol(format!(
                "expected server info from {addr}, got {}",
                other.name()
            ))),
        }
    }

    async fn run_session(&self, mut link: Link) -> Result<SessionEnd> {
        let inner = &self.inner;
        let heartbeat_config = inner.config.heartbeat();
        self.set_status(StatusEvent::ToHandshaking);

        let hello = Handshake {
            protocol_version: PROTOCOL_VERSION,
            base_dn: inner.base_dn.clone(),
            server_id: inner.server_id,
            group_id: inner.config.group_id,
            generation_id: self.generation_id(),
            server_state: self.server_state(),
            window: inner.config.window_size,
        };
        link.send(&SessionMsg::Handshake(hello)).await?;
        let reply = match link.recv_timeout(heartbeat_config.timeout()).await? {
            SessionMsg::HandshakeReply(reply) => reply,
            SessionMsg::Goodbye { reason } => {
                return Err(ReplError::protocol(format!(
                    "rejected by {}: {reason}",
                    link.peer()
                )))
            }
            other => {
                return Err(ReplError::protocol(format!(
                    "expected handshake reply, got {}",
                    other.name()
                )))
            }
        };
        for (_, csn) in reply.server_state.iter() {
            inner.generator.adjust(&csn);
        }
        let event = match reply.status {
            ReplicaStatus::Normal if inner.apply_degraded.load(Ordering::SeqCst) => {
                StatusEvent::ToDegraded
            }
            ReplicaStatus::Normal => StatusEvent::ToNormal,
            ReplicaStatus::Degraded => StatusEvent::ToDegraded,
            ReplicaStatus::BadGenId => StatusEvent::ToBadGenId,
            other => {
                return Err(ReplError::protocol(format!(
                    "replication server assigned status {other}"
                )))
            }
        };
        self.set_status(event);
        inner.outbound.register_peer(&inner.base_dn, reply.server_id)?;
        info!(
            base_dn = %inner.base_dn,
            server = %link.peer(),
            replication_server = %reply.server_id,
            status = %reply.status,
            generation_id = reply.generation_id,
            "session established"
        );
        if reply.status == ReplicaStatus::BadGenId {
            warn!(
                base_dn = %inner.base_dn,
                local = self.generation_id(),
                remote = reply.generation_id,
                reason = reply.reason.as_deref().unwrap_or_default(),
                "generation mismatch, updates suspended"
            );
        }

        let (sender, mut receiver) = link.split();
        let heartbeat = Arc::new(HeartbeatMonitor::new(heartbeat_config));
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer_stop = CancellationToken::new();
        let mut writer = tokio::spawn(drain_outbox(
            sender,
            outbox_rx,
            Arc::clone(&heartbeat),
            writer_stop.clone(),
        ));
        let mut ctx = SessionCtx {
            server: reply.server_id,
            outbox,
            send_window: SendWindow::new(reply.window),
            recv_window: RecvWindow::new(inner.config.window_size),
            token: inner.cancel.child_token(),
            pump: None,
            import: None,
        };

        let end = async {
            if reply.status.exchanges_updates() {
                let pump = self.spawn_pump(reply.server_state.max_csn(inner.server_id), &ctx)?;
                ctx.pump = Some(pump);
            } else if inner.config.auto_resync {
                self.start_full_update(&mut ctx).await?;
            }
            self.session_loop(&mut ctx, &mut receiver, &heartbeat).await
        }
        .await;

        ctx.token.cancel();
        ctx.send_window.close();
        ctx.stop_pump().await;
        drop(ctx);
        writer_stop.cancel();
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        end
    }

    async fn session_loop(
        &self,
        ctx: &mut SessionCtx,
        receiver: &mut LinkReceiver,
        heartbeat: &HeartbeatMonitor,
    ) -> Result<SessionEnd> {
        let mut ticker = tokio::time::interval(heartbeat.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut admin = self.inner.admin_rx.lock().await;

        loop {
            tokio::select! {
                _ = ctx.token.cancelled() => return Ok(SessionEnd::Shutdown),
                Some(command) = admin.recv() => match command {
                    AdminCommand::ForceReconnect => {
                        enqueue(&ctx.outbox, SessionMsg::Goodbye {
                            reason: "reconnect requested".to_string(),
                        })
                        .await?;
                        return Ok(SessionEnd::Reconnect);
                    }
                    AdminCommand::ForceResync => self.start_full_update(ctx).await?,
                },
                _ = ticker.tick() => {
                    if heartbeat.tick() == HeartbeatState::Dead {
                        return Ok(SessionEnd::Lost("heartbeat timeout".to_string()));
                    }
                    if let Some(credits) = ctx.recv_window.flush() {
                        self.send_ack(ctx, credits).await?;
                    }
                    if heartbeat.heartbeat_due() {
                        enqueue(&ctx.outbox, SessionMsg::Heartbeat).await?;
                    }
                }
                msg = receiver.recv() => match msg? {
                    Some(msg) => {
                        heartbeat.record_received();
                        if let Some(end) = self.handle_msg(msg, ctx).await? {
                            return Ok(end);
                        }
                    }
                    None => return Ok(SessionEnd::Lost("closed by replication server".to_string())),
                },
            }
        }
    }

    async fn send_ack(&self, ctx: &SessionCtx, credits: u32) -> Result<()> {
        enqueue(
            &ctx.outbox,
            SessionMsg::WindowAck {
                credits,
                server_state: self.server_state(),
            },
        )
        .await
    }

    async fn handle_msg(&self, msg: SessionMsg, ctx: &mut SessionCtx) -> Result<Option<SessionEnd>> {
        let inner = &self.inner;
        match msg {
            SessionMsg::Update(update) => {
                if let Some(end) = self.replay_relayed(update).await {
                    return Ok(Some(end));
                }
                if let Some(credits) = ctx.recv_window.record() {
                    self.send_ack(ctx, credits).await?;
                }
            }
            SessionMsg::AssuredUpdate { update, mode } => {
                let csn = update.csn;
                let suspended = !self.status().exchanges_updates();
                let end = self.replay_relayed(update).await;
                let mut ack = AssuredAck::ok(csn);
                if suspended {
                    ack.wrong_status = true;
                } else if end.is_some() {
                    ack.replay_error = true;
                }
                if !ack.is_success() {
                    ack.failed_servers.push(inner.server_id);
                }
                debug!(base_dn = %inner.base_dn, csn = %csn, mode = %mode, success = ack.is_success(), "assured update answered");
                enqueue(&ctx.outbox, SessionMsg::Ack(ack)).await?;
                if end.is_some() {
                    return Ok(end);
                }
                if let Some(credits) = ctx.recv_window.record() {
                    self.send_ack(ctx, credits).await?;
                }
            }
            SessionMsg::Ack(ack) => {
                let waiter = inner.assured.lock().remove(&ack.csn);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(ack);
                    }
                    None => debug!(base_dn = %inner.base_dn, csn = %ack.csn, "late assured ack"),
                }
            }
            SessionMsg::WindowAck {
                credits,
                server_state,
            } => {
                ctx.send_window.credit(credits);
                inner
                    .outbound
                    .record_ack(&inner.base_dn, ctx.server, &server_state)?;
                match inner.outbound.purge_to_watermark_at(&inner.base_dn, i64::MAX) {
                    Ok(0) => {}
                    Ok(purged) => debug!(base_dn = %inner.base_dn, purged, "outbound changelog purged"),
                    Err(e) => warn!(base_dn = %inner.base_dn, error = %e, "outbound purge failed"),
                }
            }
            SessionMsg::Heartbeat => {}
            SessionMsg::StatusNotice(status) => match status {
                ReplicaStatus::Normal => {
                    if !inner.apply_degraded.load(Ordering::SeqCst) {
                        self.set_status(StatusEvent::ToNormal);
                    }
                }
                ReplicaStatus::Degraded => self.set_status(StatusEvent::ToDegraded),
                ReplicaStatus::BadGenId => {
                    ctx.stop_pump().await;
                    self.set_status(StatusEvent::ToBadGenId);
                    if inner.config.auto_resync {
                        self.start_full_update(ctx).await?;
                    }
                }
                other => debug!(base_dn = %inner.base_dn, status = %other, "status notice ignored"),
            },
            SessionMsg::InitializeRequest { requester } => {
                self.serve_full_update(requester, ctx).await?;
            }
            SessionMsg::InitializeEntries { target, entries } => match ctx.import.as_mut() {
                Some(buffer) if target == inner.server_id => buffer.extend(entries),
                _ => warn!(base_dn = %inner.base_dn, target = %target, "unexpected full update entries"),
            },
            SessionMsg::InitializeDone {
                target,
                generation_id,
                server_state,
            } => {
                if target != inner.server_id {
                    warn!(base_dn = %inner.base_dn, target = %target, "full update for another replica");
                    return Ok(None);
                }
                let Some(records) = ctx.import.take() else {
                    warn!(base_dn = %inner.base_dn, "full update completion without request");
                    return Ok(None);
                };
                self.import_full_update(records, generation_id, server_state)
                    .await?;
                enqueue(
                    &ctx.outbox,
                    SessionMsg::Goodbye {
                        reason: "reinitialized".to_string(),
                    },
                )
                .await?;
                return Ok(Some(SessionEnd::Reconnect));
            }
            SessionMsg::InitializeFailed { target, reason } => {
                if target == inner.server_id && ctx.import.take().is_some() {
                    warn!(base_dn = %inner.base_dn, reason = %reason, "full update failed");
                    inner
                        .full_update
                        .send_replace(FullUpdateEvent::Failed { reason: reason.clone() });
                    return Ok(Some(SessionEnd::Lost(format!("full update failed: {reason}"))));
                }
            }
            SessionMsg::Goodbye { reason } => return Ok(Some(SessionEnd::Lost(reason))),
            other @ (SessionMsg::Handshake(_)
            | SessionMsg::HandshakeReply(_)
            | SessionMsg::ServerInfoRequest { .. }
            | SessionMsg::ServerInfo(_)) => {
                return Err(ReplError::protocol(format!(
                    "unexpected {} during session",
                    other.name()
                )))
            }
        }
        Ok(None)
    }

    /// Replays an update relayed by the replication server.
    ///
    /// `Some` ends the session without acknowledging the update, so the
    /// replication server relays it again on the next session.
    async fn replay_relayed(&self, update: UpdateMsg) -> Option<SessionEnd> {
        let inner = &self.inner;
        if !self.status().exchanges_updates() {
            debug!(base_dn = %inner.base_dn, csn = %update.csn, "update ignored while suspended");
            return None;
        }
        let csn = update.csn;
        match self.receive(update).await {
            Ok(_) => None,
            // Full update already requested.
            Err(ReplError::ConflictOverflow { .. }) => None,
            Err(ReplError::Shutdown) => Some(SessionEnd::Shutdown),
            Err(e) => Some(SessionEnd::ApplyFailed(format!("update {csn} not applied: {e}"))),
        }
    }

    fn spawn_pump(
        &self,
        after: Option<Csn>,
        ctx: &SessionCtx,
    ) -> Result<(CancellationToken, JoinHandle<()>)> {
        let inner = Arc::clone(&self.inner);
        let own = ReplicaId::new(inner.base_dn.clone(), inner.server_id);
        let mut cursor = inner.outbound.read_from(&own, after)?;
        let token = ctx.token.child_token();
        let stop = token.clone();
        let window = ctx.send_window.clone();
        let outbox = ctx.outbox.clone();
        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = next_outbound(&window, &mut cursor) => next,
                };
                let sent = match next {
                    Ok(msg) => enqueue(&outbox, inner.outbound_msg(msg)).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    if !stop.is_cancelled() {
                        warn!(replica = %own, error = %e, "outbound pump stopped");
                    }
                    break;
                }
            }
        });
        Ok((token, handle))
    }

    async fn start_full_update(&self, ctx: &mut SessionCtx) -> Result<()> {
        if ctx.import.is_some() {
            return Ok(());
        }
        ctx.stop_pump().await;
        ctx.import = Some(Vec::new());
        self.set_status(StatusEvent::ToFullUpdate);
        self.inner.full_update.send_replace(FullUpdateEvent::Started);
        info!(base_dn = %self.inner.base_dn, "requesting full update");
        enqueue(
            &ctx.outbox,
            SessionMsg::InitializeRequest {
                requester: self.inner.server_id,
            },
        )
        .await
    }

    async fn serve_full_update(&self, requester: ServerId, ctx: &SessionCtx) -> Result<()> {
        let inner = &self.inner;
        let snapshot = {
            let _gate = inner.gate.write().await;
            self.store()
                .export()
                .map(|records| (records, self.generation_id(), self.server_state()))
        };
        let (records, generation_id, server_state) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(base_dn = %inner.base_dn, requester = %requester, error = %e, "export failed");
                return enqueue(
                    &ctx.outbox,
                    SessionMsg::InitializeFailed {
                        target: requester,
                        reason: e.to_string(),
                    },
                )
                .await;
            }
        };
        info!(
            base_dn = %inner.base_dn,
            requester = %requester,
            records = records.len(),
            "serving full update"
        );
        for chunk in records.chunks(crate::protocol::INITIALIZE_CHUNK_SIZE) {
            enqueue(
                &ctx.outbox,
                SessionMsg::InitializeEntries {
                    target: requester,
                    entries: chunk.to_vec(),
                },
            )
            .await?;
        }
        enqueue(
            &ctx.outbox,
            SessionMsg::InitializeDone {
                target: requester,
                generation_id,
                server_state,
            },
        )
        .await
    }

    async fn import_full_update(
        &self,
        records: Vec<KvPair>,
        generation_id: u64,
        server_state: ServerState,
    ) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.gate.write().await;
        let count = records.len();
        let result = self.replace_data(records, generation_id, &server_state);
        if let Err(e) = result {
            error!(base_dn = %inner.base_dn, error = %e, "full update import failed");
            inner
                .full_update
                .send_replace(FullUpdateEvent::Failed { reason: e.to_string() });
            return Err(e);
        }
        for (_, csn) in server_state.iter() {
            inner.generator.adjust(&csn);
        }
        inner.counters.full_updates.fetch_add(1, Ordering::Relaxed);
        inner.apply_degraded.store(false, Ordering::SeqCst);
        info!(
            base_dn = %inner.base_dn,
            records = count,
            generation_id,
            state = %server_state,
            "full update imported"
        );
        inner
            .full_update
            .send_replace(FullUpdateEvent::Completed { records: count });
        Ok(())
    }

    fn replace_data(
        &self,
        records: Vec<KvPair>,
        generation_id: u64,
        server_state: &ServerState,
    ) -> Result<()> {
        let inner = &self.inner;
        self.store().import(records)?;
        inner.engine.clear_pending();
        inner.held_back.lock().clear();
        {
            let mut state = inner.state.lock();
            *state = server_state.clone();
            self.store().store_meta(STATE_META, &*state)?;
        }
        generation::persist(self.store(), generation_id)?;
        inner.generation_id.store(generation_id, Ordering::SeqCst);
        inner.outbound.clear_domain(&inner.base_dn)
    }
}

async fn next_outbound(window: &SendWindow, cursor: &mut ChangelogCursor) -> Result<UpdateMsg> {
    window.acquire().await?;
    cursor.next().await?.decode()
}

/// Builds the update for a local change against the stored entry.
fn stamp(
    change: &LocalChange,
    uuid: EntryUuid,
    csn: Csn,
    current: Option<&StoredEntry>,
) -> Result<UpdateMsg> {
    let live = current.filter(|entry| !entry.tombstone);
    let missing = || ReplError::NoSuchEntry {
        target: change.dn().to_string(),
    };
    let payload = match change {
        LocalChange::Add { dn, attributes } => {
            if current.is_some() {
                return Err(ReplError::EntryAlreadyExists { dn: dn.to_string() });
            }
            UpdatePayload::Add {
                attributes: normalize_attributes(attributes),
            }
        }
        LocalChange::Modify { modifications, .. } => {
            let entry = live.ok_or_else(missing)?;
            let changes = to_attr_changes(&entry.attributes, modifications);
            if changes.is_empty() {
                return Err(ReplError::protocol("modify without modifications"));
            }
            let historical = changes
                .iter()
                .map(|change| (change.attribute.clone(), csn))
                .collect();
            UpdatePayload::Modify {
                changes,
                historical,
            }
        }
        LocalChange::Delete { .. } => {
            live.ok_or_else(missing)?;
            UpdatePayload::Delete
        }
        LocalChange::Rename { new_dn, .. } => {
            live.ok_or_else(missing)?;
            UpdatePayload::Rename {
                new_dn: new_dn.clone(),
            }
        }
    };
    Ok(UpdateMsg {
        csn,
        entry_uuid: uuid,
        dn: change.dn().clone(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchOp, ExportIter, Key, MemoryBackend, Value};
    use crate::protocol::HandshakeReply;
    use crate::session::InProcessNetwork;
    use crate::update_msg::{Attributes, Modification};

    /// Memory backend whose entry writes can be switched off.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl FlakyBackend {
        fn fail_entry_writes(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl KvBackend for FlakyBackend {
        fn get(&self, key: &[u8]) -> Result<Option<Value>> {
            self.inner.get(key)
        }

        fn put(&self, key: Key, value: Value) -> Result<()> {
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> Result<()> {
            self.inner.delete(key)
        }

        fn read_modify_write(
            &self,
            key: &[u8],
            f: &mut dyn FnMut(Option<&[u8]>) -> Result<Vec<BatchOp>>,
        ) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ReplError::backend("entry writes disabled"));
            }
            self.inner.read_modify_write(key, f)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
            self.inner.scan_prefix(prefix)
        }

        fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<KvPair>> {
            self.inner.scan_page(prefix, after, limit)
        }

        fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
            self.inner.write_batch(ops)
        }

        fn import_all(&self, prefix: &[u8], pairs: Vec<KvPair>) -> Result<()> {
            self.inner.import_all(prefix, pairs)
        }

        fn export_all(&self, prefix: &[u8]) -> ExportIter<'_> {
            ExportIter::new(self, prefix)
        }
    }

    fn config(sid: u32) -> DomainConfig {
        let mut config = DomainConfig::new("dc=example", sid);
        config.replication_servers = vec!["rs".to_string()];
        config.heartbeat_interval_ms = 1000;
        config.apply_retry.max_retries = 0;
        config.reconnect.initial_backoff_ms = 10;
        config.reconnect.max_backoff_ms = 20;
        config
    }

    fn open(sid: u32) -> ReplicationDomain {
        ReplicationDomain::open(config(sid), Arc::new(MemoryBackend::new())).unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        let mut out = Attributes::new();
        for (k, v) in pairs {
            out.entry(k.to_string()).or_default().push(v.to_string());
        }
        out
    }

    fn add(dn: &str) -> LocalChange {
        LocalChange::Add {
            dn: Dn::new(dn),
            attributes: attrs(&[("cn", "x")]),
        }
    }

    fn outbound(domain: &ReplicationDomain) -> Vec<UpdateMsg> {
        let own = ReplicaId::new(domain.base_dn().clone(), domain.server_id());
        let mut cursor = domain.inner.outbound.read_from(&own, None).unwrap();
        let mut out = Vec::new();
        while let Some(record) = cursor.try_next().unwrap() {
            out.push(record.decode().unwrap());
        }
        out
    }

    async fn published_by(sid: u32, dns: &[&str]) -> Vec<UpdateMsg> {
        let source = open(sid);
        for dn in dns {
            source.publish(add(dn)).await.unwrap();
        }
        outbound(&source)
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_publish_applies_and_advances_state() {
        let domain = open(1);
        let csn = domain.publish(add("cn=a,dc=example")).await.unwrap();
        assert_eq!(csn.server_id(), ServerId::new(1));
        assert_eq!(domain.server_state().max_csn(ServerId::new(1)), Some(csn));
        assert!(domain.find(&Dn::new("cn=a,dc=example")).unwrap().is_some());
        assert_eq!(domain.monitor().unwrap().updates_published, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_duplicate_and_missing() {
        let domain = open(1);
        domain.publish(add("cn=a,dc=example")).await.unwrap();
        assert!(matches!(
            domain.publish(add("cn=a,dc=example")).await,
            Err(ReplError::EntryAlreadyExists { .. })
        ));
        assert!(matches!(
            domain
                .publish(LocalChange::Delete {
                    dn: Dn::new("cn=missing,dc=example")
                })
                .await,
            Err(ReplError::NoSuchEntry { .. })
        ));
        assert!(matches!(
            domain.publish(add("cn=a,dc=other")).await,
            Err(ReplError::NoSuchEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_modify_then_rename() {
        let domain = open(1);
        domain.publish(add("cn=a,dc=example")).await.unwrap();
        domain
            .publish(LocalChange::Modify {
                dn: Dn::new("cn=a,dc=example"),
                modifications: vec![Modification::Replace {
                    attribute: "mail".to_string(),
                    values: vec!["a@example.com".to_string()],
                }],
            })
            .await
            .unwrap();
        domain
            .publish(LocalChange::Rename {
                dn: Dn::new("cn=a,dc=example"),
                new_dn: Dn::new("cn=b,dc=example"),
            })
            .await
            .unwrap();
        assert!(domain.find(&Dn::new("cn=a,dc=example")).unwrap().is_none());
        let entry = domain.find(&Dn::new("cn=b,dc=example")).unwrap().unwrap();
        assert_eq!(entry.attributes["mail"], vec!["a@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_receive_drops_covered_update() {
        let source = open(2);
        let csn = source.publish(add("cn=a,dc=example")).await.unwrap();
        let own = ReplicaId::new(Dn::new("dc=example"), ServerId::new(2));
        let msg = source
            .inner
            .outbound
            .read_from(&own, None)
            .unwrap()
            .try_next()
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();

        let domain = open(1);
        assert_eq!(domain.receive(msg.clone()).await.unwrap(), ReplayOutcome::Applied);
        assert_eq!(domain.server_state().max_csn(ServerId::new(2)), Some(csn));
        assert_eq!(domain.receive(msg).await.unwrap(), ReplayOutcome::Dropped);
        let monitor = domain.monitor().unwrap();
        assert_eq!(monitor.updates_received, 2);
        assert_eq!(monitor.updates_dropped, 1);
        // Local CSNs now sort after the replayed one.
        assert!(domain.publish(add("cn=b,dc=example")).await.unwrap() > csn);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_all_reach_the_changelog() {
        let domain = open(1);
        let mut tasks = Vec::new();
        for t in 0..8 {
            let domain = domain.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    domain
                        .publish(add(&format!("cn=t{t}-{i},dc=example")))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let recorded = outbound(&domain);
        assert_eq!(recorded.len(), 400);
        assert!(recorded.windows(2).all(|pair| pair[0].csn < pair[1].csn));
        assert_eq!(domain.monitor().unwrap().updates_published, 400);
        assert_eq!(
            domain.server_state().max_csn(ServerId::new(1)),
            recorded.last().map(|msg| msg.csn)
        );
    }

    #[tokio::test]
    async fn test_failed_update_holds_back_later_ones() {
        let updates = published_by(2, &["cn=a,dc=example", "cn=b,dc=example"]).await;
        let backend = Arc::new(FlakyBackend::default());
        let domain = ReplicationDomain::open(config(1), backend.clone()).unwrap();

        backend.fail_entry_writes(true);
        assert!(matches!(
            domain.receive(updates[0].clone()).await,
            Err(ReplError::Backend { .. })
        ));
        backend.fail_entry_writes(false);

        match domain.receive(updates[1].clone()).await {
            Err(ReplError::UpdateHeldBack { csn, waiting_for }) => {
                assert_eq!(csn, updates[1].csn);
                assert_eq!(waiting_for, updates[0].csn);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(domain.server_state().max_csn(ServerId::new(2)), None);
        assert_eq!(domain.monitor().unwrap().apply_failures, 1);

        // Redelivered in order, nothing is lost.
        assert_eq!(domain.receive(updates[0].clone()).await.unwrap(), ReplayOutcome::Applied);
        assert_eq!(domain.receive(updates[1].clone()).await.unwrap(), ReplayOutcome::Applied);
        assert!(domain.find(&Dn::new("cn=a,dc=example")).unwrap().is_some());
        assert!(domain.find(&Dn::new("cn=b,dc=example")).unwrap().is_some());
        assert_eq!(
            domain.server_state().max_csn(ServerId::new(2)),
            Some(updates[1].csn)
        );
    }

    #[tokio::test]
    async fn test_assured_publish_times_out_without_session() {
        let mut config = config(1);
        config.assured = Some(AssuredMode::SafeData);
        config.assured_timeout_ms = 30;
        let domain = ReplicationDomain::open(config, Arc::new(MemoryBackend::new())).unwrap();

        let csn = domain.publish(add("cn=a,dc=example")).await.unwrap();
        assert_eq!(domain.server_state().max_csn(ServerId::new(1)), Some(csn));
        let monitor = domain.monitor().unwrap();
        assert_eq!(monitor.assured_updates, 1);
        assert_eq!(monitor.assured_failures, 1);
        assert!(domain.inner.assured.lock().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let first = ReplicationDomain::open(config(1), Arc::clone(&backend)).unwrap();
        let csn = first.publish(add("cn=a,dc=example")).await.unwrap();
        let generation_id = first.generation_id();
        drop(first);

        let reopened = ReplicationDomain::open(config(1), backend).unwrap();
        assert_eq!(reopened.server_state().max_csn(ServerId::new(1)), Some(csn));
        assert_eq!(reopened.generation_id(), generation_id);
        assert!(reopened.publish(add("cn=b,dc=example")).await.unwrap() > csn);
    }

    async fn accept_with(
        listener: &mut mpsc::Receiver<Link>,
        status: ReplicaStatus,
    ) -> (Link, Handshake) {
        let mut link = listener.recv().await.unwrap();
        let hello = match link.recv().await.unwrap() {
            Some(SessionMsg::Handshake(hello)) => hello,
            other => panic!("unexpected {:?}", other),
        };
        link.send(&SessionMsg::HandshakeReply(HandshakeReply {
            server_id: ServerId::new(100),
            generation_id: hello.generation_id,
            server_state: ServerState::new(),
            window: 10,
            status,
            reason: None,
        }))
        .await
        .unwrap();
        (link, hello)
    }

    async fn next_non_heartbeat(link: &mut Link) -> SessionMsg {
        loop {
            match link.recv().await.unwrap() {
                Some(SessionMsg::Heartbeat) => continue,
                Some(msg) => return msg,
                None => panic!("link closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_session_sends_published_changes() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let domain = open(1);
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        let (mut link, hello) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        assert_eq!(hello.server_id, ServerId::new(1));
        let csn = domain.publish(add("cn=a,dc=example")).await.unwrap();
        match next_non_heartbeat(&mut link).await {
            SessionMsg::Update(update) => assert_eq!(update.csn, csn),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(domain.status(), ReplicaStatus::Normal);

        domain.shutdown().await;
        task.await.unwrap().unwrap();
        assert_eq!(domain.status(), ReplicaStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_bad_generation_triggers_full_update() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let domain = open(1);
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        let source = open(2);
        source.publish(add("cn=seed,dc=example")).await.unwrap();

        let (mut link, _) = accept_with(&mut listener, ReplicaStatus::BadGenId).await;
        match next_non_heartbeat(&mut link).await {
            SessionMsg::InitializeRequest { requester } => assert_eq!(requester, ServerId::new(1)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(domain.status(), ReplicaStatus::FullUpdate);
        link.send(&SessionMsg::InitializeEntries {
            target: ServerId::new(1),
            entries: source.store().export().unwrap(),
        })
        .await
        .unwrap();
        link.send(&SessionMsg::InitializeDone {
            target: ServerId::new(1),
            generation_id: source.generation_id(),
            server_state: source.server_state(),
        })
        .await
        .unwrap();
        match next_non_heartbeat(&mut link).await {
            SessionMsg::Goodbye { .. } => {}
            other => panic!("unexpected {:?}", other),
        }

        let (_link, hello) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        assert_eq!(hello.generation_id, source.generation_id());
        assert_eq!(hello.server_state, source.server_state());
        assert!(domain.find(&Dn::new("cn=seed,dc=example")).unwrap().is_some());
        assert_eq!(domain.monitor().unwrap().full_updates, 1);

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serves_full_update_to_requester() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let domain = open(1);
        domain.publish(add("cn=a,dc=example")).await.unwrap();
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        let (mut link, _) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        // Own change first, relayed by the pump.
        assert!(matches!(next_non_heartbeat(&mut link).await, SessionMsg::Update(_)));
        link.send(&SessionMsg::InitializeRequest {
            requester: ServerId::new(9),
        })
        .await
        .unwrap();
        let mut received = Vec::new();
        loop {
            match next_non_heartbeat(&mut link).await {
                SessionMsg::InitializeEntries { target, entries } => {
                    assert_eq!(target, ServerId::new(9));
                    received.extend(entries);
                }
                SessionMsg::InitializeDone { generation_id, .. } => {
                    assert_eq!(generation_id, domain.generation_id());
                    break;
                }
                SessionMsg::WindowAck { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, domain.store().export().unwrap());

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_apply_failure_ends_session_until_redelivered() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let backend = Arc::new(FlakyBackend::default());
        let domain = ReplicationDomain::open(config(1), backend.clone()).unwrap();
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });
        let updates = published_by(2, &["cn=a,dc=example", "cn=b,dc=example"]).await;

        backend.fail_entry_writes(true);
        let (mut link, _) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        for update in &updates {
            // The domain may already have closed the link.
            let _ = link.send(&SessionMsg::Update(update.clone())).await;
        }
        while let Some(msg) = link.recv().await.unwrap() {
            if let SessionMsg::WindowAck { server_state, .. } = msg {
                assert_eq!(server_state.max_csn(ServerId::new(2)), None);
            }
        }
        assert_eq!(domain.monitor().unwrap().apply_failures, 1);

        backend.fail_entry_writes(false);
        let (mut link, hello) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        assert_eq!(hello.server_state.max_csn(ServerId::new(2)), None);
        eventually("degraded after reconnect", || domain.status() == ReplicaStatus::Degraded).await;
        for update in &updates {
            link.send(&SessionMsg::Update(update.clone())).await.unwrap();
        }
        eventually("redelivered updates applied", || {
            domain.find(&Dn::new("cn=b,dc=example")).unwrap().is_some()
                && domain.status() == ReplicaStatus::Normal
        })
        .await;
        assert!(domain.find(&Dn::new("cn=a,dc=example")).unwrap().is_some());

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_dropped_and_reconnected() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let mut config = config(1);
        config.heartbeat_interval_ms = 20;
        config.max_missed_heartbeats = 3;
        let domain = ReplicationDomain::open(config, Arc::new(MemoryBackend::new())).unwrap();
        let mut changes = domain.subscribe_status();
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        // Kept open but never answers.
        let (_silent, _) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let change = changes.recv().await.unwrap();
                if change.from == ReplicaStatus::Normal && change.to == ReplicaStatus::NotConnected {
                    break;
                }
            }
        })
        .await;
        assert!(dropped.is_ok(), "session with a silent server kept open");

        let (mut link, _) = tokio::time::timeout(
            Duration::from_secs(5),
            accept_with(&mut listener, ReplicaStatus::Normal),
        )
        .await
        .expect("no new session after heartbeat timeout");
        let alive = tokio::spawn(async move {
            while link.send(&SessionMsg::Heartbeat).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        eventually("second session normal", || domain.status() == ReplicaStatus::Normal).await;
        assert_eq!(domain.monitor().unwrap().sessions, 2);

        domain.shutdown().await;
        task.await.unwrap().unwrap();
        alive.abort();
    }

    #[tokio::test]
    async fn test_assured_publish_waits_for_ack() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let mut config = config(1);
        config.assured = Some(AssuredMode::SafeData);
        config.assured_timeout_ms = 10_000;
        let domain = ReplicationDomain::open(config, Arc::new(MemoryBackend::new())).unwrap();
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        let (mut link, _) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        let publisher = domain.clone();
        let publishing = tokio::spawn(async move { publisher.publish(add("cn=a,dc=example")).await });
        let csn = match next_non_heartbeat(&mut link).await {
            SessionMsg::AssuredUpdate { update, mode } => {
                assert_eq!(mode, AssuredMode::SafeData);
                update.csn
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(!publishing.is_finished());
        link.send(&SessionMsg::Ack(AssuredAck::ok(csn))).await.unwrap();
        assert_eq!(publishing.await.unwrap().unwrap(), csn);
        let monitor = domain.monitor().unwrap();
        assert_eq!(monitor.assured_updates, 1);
        assert_eq!(monitor.assured_failures, 0);

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relayed_assured_update_acknowledged_after_replay() {
        let network = InProcessNetwork::new();
        let mut listener = network.listen("rs");
        let domain = open(1);
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });
        let update = published_by(2, &["cn=a,dc=example"]).await.remove(0);

        let (mut link, _) = accept_with(&mut listener, ReplicaStatus::Normal).await;
        link.send(&SessionMsg::AssuredUpdate {
            update: update.clone(),
            mode: AssuredMode::SafeRead,
        })
        .await
        .unwrap();
        match next_non_heartbeat(&mut link).await {
            SessionMsg::Ack(ack) => {
                assert_eq!(ack.csn, update.csn);
                assert!(ack.is_success());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(domain.find(&Dn::new("cn=a,dc=example")).unwrap().is_some());

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }

    async fn answer_info(listener: &mut mpsc::Receiver<Link>, info: ServerInfo) {
        let mut link = listener.recv().await.unwrap();
        match link.recv().await.unwrap() {
            Some(SessionMsg::ServerInfoRequest { base_dn }) => {
                assert_eq!(base_dn, Dn::new("dc=example"))
            }
            other => panic!("unexpected {:?}", other),
        }
        link.send(&SessionMsg::ServerInfo(info)).await.unwrap();
    }

    fn server_info(sid: u32, group_id: u8, weight: u32) -> ServerInfo {
        ServerInfo {
            server_id: ServerId::new(sid),
            group_id,
            weight,
            generation_id: None,
            server_state: ServerState::new(),
            connected_domains: 0,
        }
    }

    #[tokio::test]
    async fn test_connects_to_server_of_own_group() {
        let network = InProcessNetwork::new();
        let mut far = network.listen("rs-far");
        let mut near = network.listen("rs-near");
        let mut config = config(1);
        config.replication_servers = vec!["rs-far".to_string(), "rs-near".to_string()];
        let domain = ReplicationDomain::open(config, Arc::new(MemoryBackend::new())).unwrap();
        let runner = domain.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(network)).await });

        answer_info(&mut far, server_info(100, 2, 10)).await;
        answer_info(&mut near, server_info(101, 1, 1)).await;
        let (_link, hello) = accept_with(&mut near, ReplicaStatus::Normal).await;
        assert_eq!(hello.group_id, 1);
        assert_eq!(domain.monitor().unwrap().connected_to.as_deref(), Some("rs-near"));
        assert!(far.try_recv().is_err());

        domain.shutdown().await;
        task.await.unwrap().unwrap();
    }
}
