//! Message links between a domain and a replication server.
//!
//! A [`Link`] carries [`SessionMsg`]s in both directions and splits into a
//! sending and a receiving half so that a session can read and write from
//! separate tasks. Links run over TCP (framed by [`crate::wire`]) or over
//! in-process channels, which is what tests and single-process deployments
//! use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ReplError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::SessionMsg;
use crate::wire;

/// Messages buffered per direction on in-process links.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Outgoing messages queued per session.
pub const OUTBOX_CAPACITY: usize = 256;

/// Link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Failed sends.
    pub send_errors: u64,
}

#[derive(Debug, Default)]
struct LinkStatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_errors: AtomicU64,
}

impl LinkStatsInner {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

enum Outbound {
    Channel(mpsc::Sender<SessionMsg>),
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
}

enum Inbound {
    Channel(mpsc::Receiver<SessionMsg>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

/// Sending half of a link.
pub struct LinkSender {
    outbound: Outbound,
    stats: Arc<LinkStatsInner>,
}

impl LinkSender {
    /// Sends one message.
    pub async fn send(&mut self, msg: &SessionMsg) -> Result<()> {
        let result = match &mut self.outbound {
            Outbound::Channel(tx) => tx
                .send(msg.clone())
                .await
                .map_err(|_| ReplError::Io(std::io::ErrorKind::BrokenPipe.into())),
            Outbound::Stream(writer) => wire::write_msg(writer, msg).await,
        };
        match result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Receiving half of a link.
pub struct LinkReceiver {
    inbound: Inbound,
    stats: Arc<LinkStatsInner>,
}

impl LinkReceiver {
    /// Next message; `None` once the peer closed the link.
    pub async fn recv(&mut self) -> Result<Option<SessionMsg>> {
        let msg = match &mut self.inbound {
            Inbound::Channel(rx) => rx.recv().await,
            Inbound::Stream(reader) => wire::read_msg(reader).await?,
        };
        if msg.is_some() {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(msg)
    }
}

/// Bidirectional message link.
pub struct Link {
    sender: LinkSender,
    receiver: LinkReceiver,
    peer: String,
    stats: Arc<LinkStatsInner>,
}

impl Link {
    /// Creates two connected in-process links.
    pub fn pair(peer_a: &str, peer_b: &str) -> (Link, Link) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let a = Link::from_parts(Outbound::Channel(tx_a), Inbound::Channel(rx_b), peer_b);
        let b = Link::from_parts(Outbound::Channel(tx_b), Inbound::Channel(rx_a), peer_a);
        (a, b)
    }

    /// Wraps a byte stream with frame encoding.
    pub fn from_stream<S>(stream: S, peer: &str) -> Link
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Link::from_parts(
            Outbound::Stream(Box::new(writer)),
            Inbound::Stream(Box::new(reader)),
            peer,
        )
    }

    /// Wraps an established TCP connection.
    pub fn from_tcp(stream: TcpStream) -> Result<Link> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Ok(Link::from_stream(stream, &peer))
    }

    fn from_parts(outbound: Outbound, inbound: Inbound, peer: &str) -> Link {
        let stats = Arc::new(LinkStatsInner::default());
        Link {
            sender: LinkSender {
                outbound,
                stats: Arc::clone(&stats),
            },
            receiver: LinkReceiver {
                inbound,
                stats: Arc::clone(&stats),
            },
            peer: peer.to_string(),
            stats,
        }
    }

    /// Address or name of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one message.
    pub async fn send(&mut self, msg: &SessionMsg) -> Result<()> {
        self.sender.send(msg).await
    }

    /// Next message; `None` once the peer closed the link.
    pub async fn recv(&mut self) -> Result<Option<SessionMsg>> {
        self.receiver.recv().await
    }

    /// Next message, failing if none arrives within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<SessionMsg> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Ok(Some(msg))) => Ok(msg),
            Ok(Ok(None)) => Err(ReplError::protocol("link closed by peer")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReplError::protocol(format!(
                "no message from {} within {:?}",
                self.peer, timeout
            ))),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LinkStats {
        self.stats.snapshot()
    }

    /// Splits into independently owned halves.
    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (self.sender, self.receiver)
    }
}

/// Opens links to replication servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `addr`.
    async fn connect(&self, addr: &str) -> Result<Link>;
}

/// TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector giving up on a connection attempt after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Link> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ReplError::Io(std::io::ErrorKind::TimedOut.into()))??;
        tracing::debug!(addr, "TCP connected");
        Link::from_tcp(stream)
    }
}

/// In-process network: named listeners reachable through [`Connector`].
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Link>>>>,
}

impl InProcessNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening on `addr`; incoming links arrive on the returned receiver.
    ///
    /// Dropping the receiver makes `addr` unreachable.
    pub fn listen(&self, addr: &str) -> mpsc::Receiver<Link> {
        let (tx, rx) = mpsc::channel(16);
        self.listeners.lock().insert(addr.to_string(), tx);
        rx
    }

    /// Removes the listener on `addr`.
    pub fn unlisten(&self, addr: &str) {
        self.listeners.lock().remove(addr);
    }
}

#[async_trait]
impl Connector for InProcessNetwork {
    async fn connect(&self, addr: &str) -> Result<Link> {
        let listener = self
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| ReplError::Io(std::io::ErrorKind::ConnectionRefused.into()))?;
        let (local, remote) = Link::pair("local", addr);
        listener
            .send(remote)
            .await
            .map_err(|_| ReplError::Io(std::io::ErrorKind::ConnectionRefused.into()))?;
        Ok(local)
    }
}

/// Writes queued messages to `sender` until the outbox closes or a send fails.
///
/// Once `stop` is cancelled the outbox stops accepting messages; what was
/// already queued is still written.
pub async fn drain_outbox(
    mut sender: LinkSender,
    mut outbox: mpsc::Receiver<SessionMsg>,
    heartbeat: Arc<HeartbeatMonitor>,
    stop: CancellationToken,
) {
    let mut closing = false;
    loop {
        let msg = tokio::select! {
            biased;
            msg = outbox.recv() => msg,
            _ = stop.cancelled(), if !closing => {
                outbox.close();
                closing = true;
                continue;
            }
        };
        let Some(msg) = msg else { break };
        if let Err(e) = sender.send(&msg).await {
            tracing::debug!(error = %e, "session writer stopped");
            break;
        }
        if matches!(msg, SessionMsg::Heartbeat) {
            heartbeat.record_heartbeat_sent();
        } else {
            heartbeat.record_sent();
        }
    }
}

/// Queues `msg` on a session outbox.
pub async fn enqueue(outbox: &mpsc::Sender<SessionMsg>, msg: SessionMsg) -> Result<()> {
    outbox
        .send(msg)
        .await
        .map_err(|_| ReplError::Io(std::io::ErrorKind::BrokenPipe.into()))
}
