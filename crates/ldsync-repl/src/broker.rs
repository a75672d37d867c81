//! Replication server: the hub every replica of a base DN connects to.
//!
//! The server stores each update once in its changelog, partitioned by base
//! DN and originating server, and relays it to every other connected domain
//! of that base DN in CSN order. It assigns each connected domain a status:
//! `BadGenId` when generation IDs disagree or the changelog no longer holds
//! what the domain is missing, `Degraded` when the domain's backlog exceeds
//! the configured threshold, and `Normal` otherwise.
//!
//! Full updates are routed here too: a domain's `InitializeRequest` is
//! forwarded to another domain in good standing, whose export is streamed
//! back to the requester.
//!
//! Assured updates are acknowledged once stored (safe data) or once every
//! `Normal` domain of the server's group applied them (safe read). Domains
//! of the group that are `Degraded` are not waited for and are reported in
//! the acknowledgment.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::KvBackend;
use crate::changelog::{ChangelogRecord, ChangelogStore, DomainCursor};
use crate::config::BrokerConfig;
use crate::csn::{Csn, ServerId};
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::flow::{RecvWindow, SendWindow};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatState};
use crate::monitor::{BrokerDomainMonitor, PeerMonitor};
use crate::protocol::{
    AssuredAck, AssuredMode, Handshake, HandshakeReply, ServerInfo, SessionMsg, PROTOCOL_VERSION,
};
use crate::server_state::ReplicaId;
use crate::session::{drain_outbox, enqueue, Link, LinkReceiver, OUTBOX_CAPACITY};
use crate::status::{ReplicaStatus, StatusChange, StatusEvent, StatusMachine, STATUS_CHANNEL_CAPACITY};
use crate::update_msg::UpdateMsg;

const GENERATION_PREFIX: &[u8] = b"g/";
const WRITER_DRAIN: Duration = Duration::from_secs(1);

fn generation_key(base: &Dn) -> Vec<u8> {
    let mut key = GENERATION_PREFIX.to_vec();
    key.extend_from_slice(base.index_key().as_bytes());
    key
}

/// A connected domain.
struct PeerHandle {
    server_id: ServerId,
    group_id: u8,
    generation_id: u64,
    admitted: bool,
    status: StatusMachine,
    outbox: mpsc::Sender<SessionMsg>,
    send_window: SendWindow,
    token: CancellationToken,
    relay: Mutex<Option<CancellationToken>>,
    received: AtomicU64,
    sent: Arc<AtomicU64>,
}

impl PeerHandle {
    fn stop_relay(&self) {
        if let Some(token) = self.relay.lock().take() {
            token.cancel();
        }
    }

    fn set_status(&self, event: StatusEvent) {
        if let Err(e) = self.status.apply(event) {
            debug!(peer = %self.server_id, error = %e, "peer status event ignored");
        }
    }
}

/// A safe-read update waiting for the domains that must apply it.
struct AssuredWait {
    source: ServerId,
    expected: BTreeSet<ServerId>,
    wrong_status: Vec<ServerId>,
    replay_errors: Vec<ServerId>,
    disconnected: Vec<ServerId>,
}

impl AssuredWait {
    fn into_ack(self, csn: Csn, timed_out: bool) -> AssuredAck {
        let mut failed_servers = self.wrong_status.clone();
        failed_servers.extend(&self.replay_errors);
        failed_servers.extend(&self.disconnected);
        if timed_out {
            failed_servers.extend(&self.expected);
        }
        AssuredAck {
            csn,
            timed_out: timed_out || !self.disconnected.is_empty(),
            wrong_status: !self.wrong_status.is_empty(),
            replay_error: !self.replay_errors.is_empty(),
            failed_servers,
        }
    }
}

/// One base DN served by this replication server.
struct ServerDomain {
    base_dn: Dn,
    generation_id: Mutex<Option<u64>>,
    peers: RwLock<BTreeMap<ServerId, Arc<PeerHandle>>>,
    // requester -> source of a running full update
    initializations: Mutex<HashMap<ServerId, ServerId>>,
    assured: Mutex<HashMap<Csn, AssuredWait>>,
    assured_acks: AtomicU64,
    assured_timeouts: AtomicU64,
}

impl ServerDomain {
    fn new(base_dn: Dn, generation_id: Option<u64>) -> Self {
        Self {
            base_dn,
            generation_id: Mutex::new(generation_id),
            peers: RwLock::new(BTreeMap::new()),
            initializations: Mutex::new(HashMap::new()),
            assured: Mutex::new(HashMap::new()),
            assured_acks: AtomicU64::new(0),
            assured_timeouts: AtomicU64::new(0),
        }
    }

    /// True when `peer` must receive `csn` as a safe-read update.
    fn awaits_ack(&self, csn: &Csn, peer: ServerId) -> bool {
        self.assured
            .lock()
            .get(csn)
            .is_some_and(|wait| wait.expected.contains(&peer))
    }

    async fn deliver_ack(&self, source: ServerId, ack: AssuredAck) {
        self.assured_acks.fetch_add(1, Ordering::Relaxed);
        match self.peer(source) {
            Some(peer) => {
                if let Err(e) = enqueue(&peer.outbox, SessionMsg::Ack(ack)).await {
                    debug!(peer = %source, error = %e, "assured ack not delivered");
                }
            }
            None => debug!(peer = %source, csn = %ack.csn, "assured update origin went away"),
        }
    }

    fn generation(&self) -> Option<u64> {
        *self.generation_id.lock()
    }

    fn peer(&self, server_id: ServerId) -> Option<Arc<PeerHandle>> {
        self.peers.read().get(&server_id).cloned()
    }

    fn peer_list(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.read().values().cloned().collect()
    }
}

struct ServerInner {
    config: BrokerConfig,
    server_id: ServerId,
    backend: Arc<dyn KvBackend>,
    changelog: ChangelogStore,
    domains: DashMap<String, Arc<ServerDomain>>,
    status_tx: broadcast::Sender<StatusChange>,
    cancel: CancellationToken,
}

/// Replication server.
#[derive(Clone)]
pub struct ReplicationServer {
    inner: Arc<ServerInner>,
}

impl ReplicationServer {
    /// Opens the server over `backend`, which holds its changelog and the
    /// generation ID of every base DN it serves.
    pub fn open(config: BrokerConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;
        let changelog = ChangelogStore::open(Arc::clone(&backend))?;
        let domains = DashMap::new();
        for (_, value) in backend.scan_prefix(GENERATION_PREFIX)? {
            let (base_dn, generation_id): (Dn, u64) = bincode::deserialize(&value)?;
            domains.insert(
                base_dn.index_key(),
                Arc::new(ServerDomain::new(base_dn, Some(generation_id))),
            );
        }
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        info!(
            server_id = %config.server_id(),
            domains = domains.len(),
            "replication server opened"
        );
        Ok(Self {
            inner: Arc::new(ServerInner {
                server_id: config.server_id(),
                config,
                backend,
                changelog,
                domains,
                status_tx,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Server ID of this replication server.
    pub fn server_id(&self) -> ServerId {
        self.inner.server_id
    }

    /// Changelog of this server.
    pub fn changelog(&self) -> &ChangelogStore {
        &self.inner.changelog
    }

    /// Status transitions of connected domains.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Generation ID of `base`, once known.
    pub fn generation_id(&self, base: &Dn) -> Option<u64> {
        self.inner
            .domains
            .get(&base.index_key())
            .and_then(|domain| domain.generation())
    }

    /// Status assigned to a connected domain.
    pub fn peer_status(&self, base: &Dn, server_id: ServerId) -> Option<ReplicaStatus> {
        let domain = self.inner.domains.get(&base.index_key()).map(|d| Arc::clone(d.value()))?;
        domain.peer(server_id).map(|peer| peer.status.status())
    }

    /// Cancelled when the server shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn domain(&self, base: &Dn) -> Arc<ServerDomain> {
        self.inner
            .domains
            .entry(base.index_key())
            .or_insert_with(|| Arc::new(ServerDomain::new(base.clone(), None)))
            .clone()
    }

    fn persist_generation(&self, base: &Dn, generation_id: Option<u64>) -> Result<()> {
        let key = generation_key(base);
        match generation_id {
            Some(id) => self
                .inner
                .backend
                .put(key, bincode::serialize(&(base, id))?),
            None => self.inner.backend.delete(&key),
        }
    }

    /// Decides the status of a connecting domain.
    fn admit(&self, domain: &ServerDomain, hello: &Handshake) -> Result<(ReplicaStatus, Option<String>)> {
        let generation_id = {
            let mut current = domain.generation_id.lock();
            match *current {
                Some(id) => id,
                None => {
                    self.persist_generation(&domain.base_dn, Some(hello.generation_id))?;
                    *current = Some(hello.generation_id);
                    info!(
                        base_dn = %domain.base_dn,
                        generation_id = hello.generation_id,
                        from = %hello.server_id,
                        "generation ID adopted"
                    );
                    hello.generation_id
                }
            }
        };
        if generation_id != hello.generation_id {
            let mismatch = ReplError::GenerationMismatch {
                local: generation_id,
                remote: hello.generation_id,
            };
            return Ok((ReplicaStatus::BadGenId, Some(mismatch.to_string())));
        }

        let changelog = &self.inner.changelog;
        match changelog.check_available(&domain.base_dn, &hello.server_state, Some(hello.server_id)) {
            Ok(()) => {}
            Err(e @ ReplError::ChangesPurged { .. }) => {
                return Ok((ReplicaStatus::BadGenId, Some(e.to_string())))
            }
            Err(e) => return Err(e),
        }
        let backlog =
            changelog.count_missing(&domain.base_dn, &hello.server_state, Some(hello.server_id))?;
        if backlog > self.inner.config.degraded_status_threshold {
            Ok((
                ReplicaStatus::Degraded,
                Some(format!("{backlog} changes behind")),
            ))
        } else {
            Ok((ReplicaStatus::Normal, None))
        }
    }

    /// What this server reports to domains choosing a replication server.
    pub fn server_info(&self, base: &Dn) -> ServerInfo {
        let inner = &self.inner;
        let domain = inner
            .domains
            .get(&base.index_key())
            .map(|d| Arc::clone(d.value()));
        ServerInfo {
            server_id: inner.server_id,
            group_id: inner.config.group_id,
            weight: inner.config.weight,
            generation_id: domain.as_ref().and_then(|d| d.generation()),
            server_state: inner.changelog.domain_state(base),
            connected_domains: domain.map_or(0, |d| {
                u32::try_from(d.peers.read().len()).unwrap_or(u32::MAX)
            }),
        }
    }

    /// Runs one domain session to completion.
    ///
    /// A link opened with `ServerInfoRequest` gets this server's
    /// [`ServerInfo`] and is closed.
    pub async fn accept(&self, mut link: Link) -> Result<()> {
        let inner = &self.inner;
        let heartbeat_config = inner.config.heartbeat();
        let hello = match link.recv_timeout(heartbeat_config.timeout()).await? {
            SessionMsg::Handshake(hello) => hello,
            SessionMsg::ServerInfoRequest { base_dn } => {
                let info = self.server_info(&base_dn);
                debug!(base_dn = %base_dn, addr = %link.peer(), "server info requested");
                return link.send(&SessionMsg::ServerInfo(info)).await;
            }
            other => {
                return Err(ReplError::protocol(format!(
                    "expected handshake from {}, got {}",
                    link.peer(),
                    other.name()
                )))
            }
        };
        if hello.protocol_version != PROTOCOL_VERSION {
            let _ = link
                .send(&SessionMsg::Goodbye {
                    reason: format!("unsupported protocol version {}", hello.protocol_version),
                })
                .await;
            return Err(ReplError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: hello.protocol_version,
            });
        }

        let domain = self.domain(&hello.base_dn);
        let (status, reason) = self.admit(&domain, &hello)?;
        let admitted = status != ReplicaStatus::BadGenId;
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let peer = Arc::new(PeerHandle {
            server_id: hello.server_id,
            group_id: hello.group_id,
            generation_id: hello.generation_id,
            admitted,
            status: StatusMachine::new(
                domain.base_dn.clone(),
                hello.server_id,
                inner.status_tx.clone(),
            ),
            outbox,
            send_window: SendWindow::new(hello.window),
            token: inner.cancel.child_token(),
            relay: Mutex::new(None),
            received: AtomicU64::new(0),
            sent: Arc::new(AtomicU64::new(0)),
        });
        let duplicate = {
            let mut peers = domain.peers.write();
            if peers.contains_key(&hello.server_id) {
                true
            } else {
                peers.insert(hello.server_id, Arc::clone(&peer));
                false
            }
        };
        if duplicate {
            let _ = link
                .send(&SessionMsg::Goodbye {
                    reason: format!("server ID {} already connected", hello.server_id),
                })
                .await;
            return Err(ReplError::protocol(format!(
                "duplicate session of server {} for {}",
                hello.server_id, domain.base_dn
            )));
        }

        let end = self
            .run_peer(&domain, &peer, link, outbox_rx, &hello, status, reason)
            .await;

        domain.peers.write().remove(&peer.server_id);
        peer.token.cancel();
        peer.send_window.close();
        peer.stop_relay();
        peer.set_status(StatusEvent::ToNotConnected);
        self.fail_initializations_from(&domain, peer.server_id).await;
        domain.initializations.lock().remove(&peer.server_id);
        self.release_assured(&domain, peer.server_id).await;
        match &end {
            Ok(()) => info!(base_dn = %domain.base_dn, peer = %peer.server_id, "domain disconnected"),
            Err(e) => {
                warn!(base_dn = %domain.base_dn, peer = %peer.server_id, error = %e, "domain session failed")
            }
        }
        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_peer(
        &self,
        domain: &Arc<ServerDomain>,
        peer: &Arc<PeerHandle>,
        mut link: Link,
        outbox_rx: mpsc::Receiver<SessionMsg>,
        hello: &Handshake,
        status: ReplicaStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let inner = &self.inner;
        if peer.admitted {
            inner.changelog.register_peer(&domain.base_dn, peer.server_id)?;
            inner
                .changelog
                .record_ack(&domain.base_dn, peer.server_id, &hello.server_state)?;
        }
        let reply = HandshakeReply {
            server_id: inner.server_id,
            generation_id: domain.generation().unwrap_or(hello.generation_id),
            server_state: inner.changelog.domain_state(&domain.base_dn),
            window: inner.config.window_size,
            status,
            reason: reason.clone(),
        };
        link.send(&SessionMsg::HandshakeReply(reply)).await?;
        peer.set_status(StatusEvent::ToConnecting);
        peer.set_status(StatusEvent::ToHandshaking);
        peer.set_status(match status {
            ReplicaStatus::Degraded => StatusEvent::ToDegraded,
            ReplicaStatus::BadGenId => StatusEvent::ToBadGenId,
            _ => StatusEvent::ToNormal,
        });
        info!(
            base_dn = %domain.base_dn,
            peer = %peer.server_id,
            addr = %link.peer(),
            status = %status,
            reason = reason.as_deref().unwrap_or_default(),
            "domain connected"
        );

        let (sender, mut receiver) = link.split();
        let heartbeat = Arc::new(HeartbeatMonitor::new(inner.config.heartbeat()));
        let writer_stop = CancellationToken::new();
        let mut writer = tokio::spawn(drain_outbox(
            sender,
            outbox_rx,
            Arc::clone(&heartbeat),
            writer_stop.clone(),
        ));
        let relay = if status.exchanges_updates() {
            let cursor = inner
                .changelog
                .read_domain(&domain.base_dn, &hello.server_state, Some(peer.server_id));
            Some(self.spawn_relay(domain, peer, cursor))
        } else {
            None
        };

        let end = self.peer_loop(domain, peer, &mut receiver, &heartbeat).await;

        peer.stop_relay();
        peer.send_window.close();
        if let Some(relay) = relay {
            let _ = relay.await;
        }
        writer_stop.cancel();
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            debug!(peer = %peer.server_id, "outbox not drained before close");
            writer.abort();
        }
        end
    }

    fn spawn_relay(
        &self,
        domain: &Arc<ServerDomain>,
        peer: &Arc<PeerHandle>,
        mut cursor: DomainCursor,
    ) -> JoinHandle<()> {
        let token = peer.token.child_token();
        *peer.relay.lock() = Some(token.clone());
        let window = peer.send_window.clone();
        let outbox = peer.outbox.clone();
        let sent = Arc::clone(&peer.sent);
        let domain = Arc::clone(domain);
        let server_id = peer.server_id;
        tokio::spawn(async move {
            let base_dn = &domain.base_dn;
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = next_relayed(&window, &mut cursor) => next,
                };
                let delivered = match next {
                    Ok(update) => {
                        let msg = if domain.awaits_ack(&update.csn, server_id) {
                            SessionMsg::AssuredUpdate {
                                update,
                                mode: AssuredMode::SafeRead,
                            }
                        } else {
                            SessionMsg::Update(update)
                        };
                        enqueue(&outbox, msg).await
                    }
                    Err(e) => Err(e),
                };
                match delivered {
                    Ok(()) => {
                        sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        if !token.is_cancelled() {
                            warn!(base_dn = %base_dn, peer = %server_id, error = %e, "relay stopped");
                        }
                        break;
                    }
                }
            }
        })
    }

    async fn peer_loop(
        &self,
        domain: &Arc<ServerDomain>,
        peer: &Arc<PeerHandle>,
        receiver: &mut LinkReceiver,
        heartbeat: &HeartbeatMonitor,
    ) -> Result<()> {
        let mut recv_window = RecvWindow::new(self.inner.config.window_size);
        let mut ticker = tokio::time::interval(heartbeat.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = peer.token.cancelled() => {
                    let _ = peer.outbox.try_send(SessionMsg::Goodbye {
                        reason: "replication server closing the session".to_string(),
                    });
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if heartbeat.tick() == HeartbeatState::Dead {
                        return Err(ReplError::protocol(format!(
                            "no traffic from server {} within {:?}",
                            peer.server_id,
                            heartbeat.config().timeout()
                        )));
                    }
                    if let Some(credits) = recv_window.flush() {
                        self.send_ack(domain, peer, credits).await?;
                    }
                    if heartbeat.heartbeat_due() {
                        enqueue(&peer.outbox, SessionMsg::Heartbeat).await?;
                    }
                }
                msg = receiver.recv() => match msg? {
                    Some(msg) => {
                        heartbeat.record_received();
                        if !self.handle_peer_msg(domain, peer, msg, &mut recv_window).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn send_ack(&self, domain: &ServerDomain, peer: &PeerHandle, credits: u32) -> Result<()> {
        enqueue(
            &peer.outbox,
            SessionMsg::WindowAck {
                credits,
                server_state: self.inner.changelog.domain_state(&domain.base_dn),
            },
        )
        .await
    }

    /// Handles one message of a domain; false ends the session.
    async fn handle_peer_msg(
        &self,
        domain: &Arc<ServerDomain>,
        peer: &Arc<PeerHandle>,
        msg: SessionMsg,
        recv_window: &mut RecvWindow,
    ) -> Result<bool> {
        let inner = &self.inner;
        match msg {
            SessionMsg::Update(update) => {
                if peer.status.status().exchanges_updates() {
                    self.store_update(domain, peer, &update)?;
                } else {
                    debug!(
                        base_dn = %domain.base_dn,
                        peer = %peer.server_id,
                        csn = %update.csn,
                        "update dropped while the domain is suspended"
                    );
                }
                if let Some(credits) = recv_window.record() {
                    self.send_ack(domain, peer, credits).await?;
                }
            }
            SessionMsg::AssuredUpdate { update, mode } => {
                if peer.status.status().exchanges_updates() {
                    self.store_assured(domain, peer, &update, mode).await?;
                } else {
                    debug!(
                        base_dn = %domain.base_dn,
                        peer = %peer.server_id,
                        csn = %update.csn,
                        "assured update dropped while the domain is suspended"
                    );
                }
                if let Some(credits) = recv_window.record() {
                    self.send_ack(domain, peer, credits).await?;
                }
            }
            SessionMsg::Ack(ack) => self.record_assured_ack(domain, peer.server_id, &ack).await,
            SessionMsg::WindowAck {
                credits,
                server_state,
            } => {
                peer.send_window.credit(credits);
                if peer.admitted {
                    inner
                        .changelog
                        .record_ack(&domain.base_dn, peer.server_id, &server_state)?;
                }
            }
            SessionMsg::Heartbeat => {}
            SessionMsg::InitializeRequest { requester } => {
                if requester != peer.server_id {
                    warn!(
                        base_dn = %domain.base_dn,
                        peer = %peer.server_id,
                        requester = %requester,
                        "full update requested on behalf of another server"
                    );
                } else {
                    self.route_initialize(domain, peer).await?;
                }
            }
            SessionMsg::InitializeEntries { target, .. }
            | SessionMsg::InitializeDone { target, .. }
            | SessionMsg::InitializeFailed { target, .. } => {
                self.forward_initialize(domain, peer, target, msg).await;
            }
            SessionMsg::StatusNotice(status) => {
                debug!(peer = %peer.server_id, status = %status, "status notice from domain ignored");
            }
            SessionMsg::Goodbye { reason } => {
                info!(base_dn = %domain.base_dn, peer = %peer.server_id, reason = %reason, "domain said goodbye");
                return Ok(false);
            }
            other @ (SessionMsg::Handshake(_)
            | SessionMsg::HandshakeReply(_)
            | SessionMsg::ServerInfoRequest { .. }
            | SessionMsg::ServerInfo(_)) => {
                return Err(ReplError::protocol(format!(
                    "unexpected {} from server {}",
                    other.name(),
                    peer.server_id
                )))
            }
        }
        Ok(true)
    }

    /// Stores `update`; false when the changelog already held it.
    fn store_update(&self, domain: &ServerDomain, peer: &PeerHandle, update: &UpdateMsg) -> Result<bool> {
        let replica = ReplicaId::new(domain.base_dn.clone(), update.csn.server_id());
        let record = ChangelogRecord::new(update)?;
        let stored = self.inner.changelog.append(&replica, &record)?;
        peer.received.fetch_add(1, Ordering::Relaxed);
        debug!(
            replica = %replica,
            csn = %update.csn,
            from = %peer.server_id,
            stored,
            "update received"
        );
        Ok(stored)
    }

    async fn store_assured(
        &self,
        domain: &Arc<ServerDomain>,
        peer: &PeerHandle,
        update: &UpdateMsg,
        mode: AssuredMode,
    ) -> Result<()> {
        let csn = update.csn;
        // Registered before the update becomes visible to the relays.
        let waiting = mode == AssuredMode::SafeRead && self.prepare_safe_read(domain, peer, csn);
        let stored = match self.store_update(domain, peer, update) {
            Ok(stored) => stored,
            Err(e) => {
                domain.assured.lock().remove(&csn);
                return Err(e);
            }
        };
        if waiting && stored {
            self.spawn_assured_timeout(domain, csn);
            return Ok(());
        }
        if waiting {
            domain.assured.lock().remove(&csn);
        }
        domain.deliver_ack(peer.server_id, AssuredAck::ok(csn)).await;
        Ok(())
    }

    /// Records which domains must apply `csn` before the origin is answered;
    /// false when nobody is waited for.
    fn prepare_safe_read(&self, domain: &ServerDomain, source: &PeerHandle, csn: Csn) -> bool {
        let group_id = self.inner.config.group_id;
        if source.group_id != group_id {
            return false;
        }
        let mut expected = BTreeSet::new();
        let mut wrong_status = Vec::new();
        for peer in domain.peer_list() {
            if peer.server_id == source.server_id || peer.group_id != group_id {
                continue;
            }
            match peer.status.status() {
                ReplicaStatus::Normal => {
                    expected.insert(peer.server_id);
                }
                ReplicaStatus::Degraded => wrong_status.push(peer.server_id),
                _ => {}
            }
        }
        if expected.is_empty() {
            return false;
        }
        domain.assured.lock().insert(
            csn,
            AssuredWait {
                source: source.server_id,
                expected,
                wrong_status,
                replay_errors: Vec::new(),
                disconnected: Vec::new(),
            },
        );
        true
    }

    fn spawn_assured_timeout(&self, domain: &Arc<ServerDomain>, csn: Csn) {
        let domain = Arc::clone(domain);
        let timeout = self.inner.config.assured_timeout();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            let expired = domain.assured.lock().remove(&csn);
            if let Some(wait) = expired {
                domain.assured_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    base_dn = %domain.base_dn,
                    csn = %csn,
                    missing = ?wait.expected,
                    "assured update not acknowledged in time"
                );
                let source = wait.source;
                domain.deliver_ack(source, wait.into_ack(csn, true)).await;
            }
        });
    }

    async fn record_assured_ack(&self, domain: &ServerDomain, from: ServerId, ack: &AssuredAck) {
        let finished = {
            let mut waits = domain.assured.lock();
            let Some(wait) = waits.get_mut(&ack.csn) else {
                debug!(base_dn = %domain.base_dn, csn = %ack.csn, from = %from, "late assured ack");
                return;
            };
            if !wait.expected.remove(&from) {
                return;
            }
            if !ack.is_success() {
                wait.replay_errors.push(from);
            }
            if wait.expected.is_empty() {
                waits.remove(&ack.csn)
            } else {
                None
            }
        };
        if let Some(wait) = finished {
            let source = wait.source;
            domain.deliver_ack(source, wait.into_ack(ack.csn, false)).await;
        }
    }

    /// Stops waiting for a domain that left.
    async fn release_assured(&self, domain: &ServerDomain, gone: ServerId) {
        let finished: Vec<(Csn, AssuredWait)> = {
            let mut waits = domain.assured.lock();
            for wait in waits.values_mut() {
                if wait.expected.remove(&gone) {
                    wait.disconnected.push(gone);
                }
            }
            let done: Vec<Csn> = waits
                .iter()
                .filter(|(_, wait)| wait.expected.is_empty())
                .map(|(csn, _)| *csn)
                .collect();
            done.into_iter()
                .filter_map(|csn| waits.remove(&csn).map(|wait| (csn, wait)))
                .collect()
        };
        for (csn, wait) in finished {
            let source = wait.source;
            domain.deliver_ack(source, wait.into_ack(csn, false)).await;
        }
    }

    async fn route_initialize(&self, domain: &ServerDomain, requester: &PeerHandle) -> Result<()> {
        let generation_id = domain.generation();
        let source = domain.peer_list().into_iter().find(|candidate| {
            candidate.server_id != requester.server_id
                && candidate.status.status().exchanges_updates()
                && Some(candidate.generation_id) == generation_id
        });
        let Some(source) = source else {
            warn!(
                base_dn = %domain.base_dn,
                requester = %requester.server_id,
                "no replica available to export data"
            );
            return enqueue(
                &requester.outbox,
                SessionMsg::InitializeFailed {
                    target: requester.server_id,
                    reason: format!("no replica of {} available to export data", domain.base_dn),
                },
            )
            .await;
        };

        requester.stop_relay();
        requester.set_status(StatusEvent::ToFullUpdate);
        domain
            .initializations
            .lock()
            .insert(requester.server_id, source.server_id);
        info!(
            base_dn = %domain.base_dn,
            requester = %requester.server_id,
            source = %source.server_id,
            "full update routed"
        );
        let request = SessionMsg::InitializeRequest {
            requester: requester.server_id,
        };
        if enqueue(&source.outbox, request).await.is_err() {
            domain.initializations.lock().remove(&requester.server_id);
            return enqueue(
                &requester.outbox,
                SessionMsg::InitializeFailed {
                    target: requester.server_id,
                    reason: format!("server {} went away", source.server_id),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn forward_initialize(
        &self,
        domain: &ServerDomain,
        source: &PeerHandle,
        target: ServerId,
        msg: SessionMsg,
    ) {
        let routed = domain.initializations.lock().get(&target).copied();
        if routed != Some(source.server_id) {
            warn!(
                base_dn = %domain.base_dn,
                source = %source.server_id,
                target = %target,
                kind = msg.name(),
                "full update traffic without a matching request"
            );
            return;
        }
        let finished = matches!(
            msg,
            SessionMsg::InitializeDone { .. } | SessionMsg::InitializeFailed { .. }
        );
        if finished {
            domain.initializations.lock().remove(&target);
        }
        match domain.peer(target) {
            Some(requester) => {
                if let Err(e) = enqueue(&requester.outbox, msg).await {
                    debug!(target = %target, error = %e, "full update traffic not delivered");
                }
            }
            None => debug!(target = %target, "full update requester went away"),
        }
    }

    async fn fail_initializations_from(&self, domain: &ServerDomain, source: ServerId) {
        let orphaned: Vec<ServerId> = {
            let mut initializations = domain.initializations.lock();
            let orphaned: Vec<ServerId> = initializations
                .iter()
                .filter(|(_, s)| **s == source)
                .map(|(target, _)| *target)
                .collect();
            for target in &orphaned {
                initializations.remove(target);
            }
            orphaned
        };
        for target in orphaned {
            if let Some(requester) = domain.peer(target) {
                let _ = enqueue(
                    &requester.outbox,
                    SessionMsg::InitializeFailed {
                        target,
                        reason: format!("source server {source} disconnected"),
                    },
                )
                .await;
            }
        }
    }

    /// Re-evaluates the status of every connected domain from its backlog.
    pub fn analyze_status(&self) -> Result<()> {
        let threshold = self.inner.config.degraded_status_threshold;
        let domains: Vec<Arc<ServerDomain>> =
            self.inner.domains.iter().map(|d| Arc::clone(d.value())).collect();
        for domain in domains {
            for peer in domain.peer_list() {
                let current = peer.status.status();
                if !current.exchanges_updates() {
                    continue;
                }
                let backlog = self.backlog(&domain.base_dn, peer.server_id)?;
                let wanted = if backlog > threshold {
                    ReplicaStatus::Degraded
                } else {
                    ReplicaStatus::Normal
                };
                if wanted == current {
                    continue;
                }
                peer.set_status(if wanted == ReplicaStatus::Degraded {
                    StatusEvent::ToDegraded
                } else {
                    StatusEvent::ToNormal
                });
                info!(
                    base_dn = %domain.base_dn,
                    peer = %peer.server_id,
                    backlog,
                    status = %wanted,
                    "domain status changed"
                );
                if peer.outbox.try_send(SessionMsg::StatusNotice(wanted)).is_err() {
                    debug!(peer = %peer.server_id, "status notice not queued");
                }
            }
        }
        Ok(())
    }

    fn backlog(&self, base: &Dn, peer: ServerId) -> Result<u64> {
        let acked = self
            .inner
            .changelog
            .acked_state(base, peer)
            .unwrap_or_default();
        self.inner.changelog.count_missing(base, &acked, Some(peer))
    }

    /// Purges every base DN below its watermark, keeping the configured delay.
    pub fn purge(&self) -> Result<usize> {
        let bases: Vec<Dn> = self
            .inner
            .domains
            .iter()
            .map(|d| d.value().base_dn.clone())
            .collect();
        let mut total = 0;
        for base in bases {
            let purged = self
                .inner
                .changelog
                .purge_to_watermark(&base, self.inner.config.purge_delay_ms)?;
            if purged > 0 {
                info!(base_dn = %base, purged, "changelog purged");
            }
            total += purged;
        }
        Ok(total)
    }

    /// Starts the status analyzer and the changelog purger.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let config = &server.inner.config;
            let mut status_tick =
                tokio::time::interval(Duration::from_millis(config.heartbeat_interval_ms));
            let mut purge_tick =
                tokio::time::interval(Duration::from_millis(config.purge_interval_ms));
            status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            purge_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = server.inner.cancel.cancelled() => break,
                    _ = status_tick.tick() => {
                        if let Err(e) = server.analyze_status() {
                            warn!(error = %e, "status analysis failed");
                        }
                    }
                    _ = purge_tick.tick() => {
                        if let Err(e) = server.purge() {
                            error!(error = %e, "changelog purge failed");
                        }
                    }
                }
            }
            debug!("replication server maintenance stopped");
        })
    }

    /// Accepts TCP connections until shutdown.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "replication server listening");
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            debug!(addr = %addr, "connection accepted");
            match Link::from_tcp(stream) {
                Ok(link) => self.spawn_session(link),
                Err(e) => warn!(addr = %addr, error = %e, "connection setup failed"),
            }
        }
    }

    /// Accepts in-process links until shutdown or until the network drops the listener.
    pub async fn serve_links(&self, mut links: mpsc::Receiver<Link>) -> Result<()> {
        loop {
            let link = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                link = links.recv() => link,
            };
            match link {
                Some(link) => self.spawn_session(link),
                None => return Ok(()),
            }
        }
    }

    fn spawn_session(&self, link: Link) {
        let server = self.clone();
        tokio::spawn(async move {
            let _ = server.accept(link).await;
        });
    }

    /// Sets the generation ID of `base` and drops its changelog.
    ///
    /// `None` lets the next connecting domain define the generation. Every
    /// connected domain of `base` is disconnected.
    pub fn reset_generation_id(&self, base: &Dn, generation_id: Option<u64>) -> Result<()> {
        let domain = self.domain(base);
        {
            let mut current = domain.generation_id.lock();
            self.inner.changelog.clear_domain(base)?;
            self.persist_generation(base, generation_id)?;
            *current = generation_id;
        }
        warn!(base_dn = %base, generation_id = ?generation_id, "generation ID reset");
        for peer in domain.peer_list() {
            peer.token.cancel();
        }
        Ok(())
    }

    /// Snapshot of `base`, if this server knows it.
    pub fn monitor(&self, base: &Dn) -> Result<Option<BrokerDomainMonitor>> {
        let Some(domain) = self
            .inner
            .domains
            .get(&base.index_key())
            .map(|d| Arc::clone(d.value()))
        else {
            return Ok(None);
        };
        self.domain_monitor(&domain).map(Some)
    }

    /// Snapshots of every known base DN.
    pub fn monitors(&self) -> Result<Vec<BrokerDomainMonitor>> {
        let mut domains: Vec<Arc<ServerDomain>> =
            self.inner.domains.iter().map(|d| Arc::clone(d.value())).collect();
        domains.sort_by(|a, b| a.base_dn.cmp(&b.base_dn));
        domains.iter().map(|d| self.domain_monitor(d)).collect()
    }

    fn domain_monitor(&self, domain: &ServerDomain) -> Result<BrokerDomainMonitor> {
        let changelog = &self.inner.changelog;
        let mut peers = Vec::new();
        for peer in domain.peer_list() {
            peers.push(PeerMonitor {
                server_id: peer.server_id,
                group_id: peer.group_id,
                status: peer.status.status(),
                generation_id: peer.generation_id,
                backlog: self.backlog(&domain.base_dn, peer.server_id)?,
                acked_state: changelog
                    .acked_state(&domain.base_dn, peer.server_id)
                    .unwrap_or_default(),
                updates_received: peer.received.load(Ordering::Relaxed),
                updates_sent: peer.sent.load(Ordering::Relaxed),
            });
        }
        let changelog_records = changelog
            .partitions(&domain.base_dn)
            .into_iter()
            .map(|sid| changelog.count(&ReplicaId::new(domain.base_dn.clone(), sid)))
            .sum();
        Ok(BrokerDomainMonitor {
            base_dn: domain.base_dn.clone(),
            server_id: self.inner.server_id,
            generation_id: domain.generation(),
            server_state: changelog.domain_state(&domain.base_dn),
            changelog_records,
            peers,
            purge: changelog.purge_stats(),
            assured_waiting: domain.assured.lock().len(),
            assured_acks: domain.assured_acks.load(Ordering::Relaxed),
            assured_timeouts: domain.assured_timeouts.load(Ordering::Relaxed),
        })
    }

    /// Closes every session and stops accepting new ones.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        info!(server_id = %self.inner.server_id, "replication server shut down");
    }
}

async fn next_relayed(window: &SendWindow, cursor: &mut DomainCursor) -> Result<UpdateMsg> {
    window.acquire().await?;
    cursor.next().await?.decode()
}
