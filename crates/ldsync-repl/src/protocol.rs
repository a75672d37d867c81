//! Messages exchanged between a replication domain and its replication server.
//!
//! A session starts with `Handshake` (domain → server) answered by
//! `HandshakeReply`. In `Normal`/`Degraded` status both sides then stream
//! `Update`s, each side acknowledging received updates with `WindowAck`.
//! Full-update traffic (`Initialize*`) is routed by the server between two
//! domains and is the only traffic allowed in `BadGenId`.
//!
//! Assured updates are answered with an [`AssuredAck`]. A domain choosing
//! among several replication servers first asks each one for its
//! [`ServerInfo`] on a short-lived link.

use serde::{Deserialize, Serialize};

use crate::backend::KvPair;
use crate::csn::{Csn, ServerId};
use crate::dn::Dn;
use crate::server_state::ServerState;
use crate::status::ReplicaStatus;
use crate::update_msg::UpdateMsg;

/// Session protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Entries per `InitializeEntries` message.
pub const INITIALIZE_CHUNK_SIZE: usize = 256;

/// Opening message of a domain session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version spoken by the domain.
    pub protocol_version: u8,
    /// Base DN replicated on this session.
    pub base_dn: Dn,
    /// Server ID of the domain.
    pub server_id: ServerId,
    /// Generation ID of the domain's data.
    pub generation_id: u64,
    /// Everything the domain has already seen.
    pub server_state: ServerState,
    /// Updates the domain accepts before acknowledging.
    pub window: u32,
    /// Group of the domain; assured replication stays within a group.
    pub group_id: u8,
}

/// Answer of the replication server to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Server ID of the replication server.
    pub server_id: ServerId,
    /// Generation ID of the topology for this base DN.
    pub generation_id: u64,
    /// Everything the replication server holds for this base DN.
    pub server_state: ServerState,
    /// Updates the server accepts before acknowledging.
    pub window: u32,
    /// Status assigned to the domain.
    pub status: ReplicaStatus,
    /// Why the domain was not admitted as `Normal`, if it was not.
    pub reason: Option<String>,
}

/// Acknowledgment level requested for an assured update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Acknowledged once the replication server has stored the update.
    SafeData,
    /// Acknowledged once every `Normal` replica of the same group applied it.
    SafeRead,
}

impl std::fmt::Display for AssuredMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AssuredMode::SafeData => "safe_data",
            AssuredMode::SafeRead => "safe_read",
        })
    }
}

/// Outcome of an assured update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuredAck {
    /// Update acknowledged.
    pub csn: Csn,
    /// Some expected replica did not answer in time.
    pub timed_out: bool,
    /// Some replica of the group was not `Normal` and was not waited for.
    pub wrong_status: bool,
    /// Some replica failed to apply the update.
    pub replay_error: bool,
    /// Replicas behind the flags above.
    pub failed_servers: Vec<ServerId>,
}

impl AssuredAck {
    /// Plain success for `csn`.
    pub fn ok(csn: Csn) -> Self {
        Self {
            csn,
            timed_out: false,
            wrong_status: false,
            replay_error: false,
            failed_servers: Vec::new(),
        }
    }

    /// True when no flag is raised.
    pub fn is_success(&self) -> bool {
        !(self.timed_out || self.wrong_status || self.replay_error)
    }
}

/// What a replication server reports about itself for server selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server ID of the replication server.
    pub server_id: ServerId,
    /// Group of the replication server.
    pub group_id: u8,
    /// Share of the domains this server should carry, relative to its peers.
    pub weight: u32,
    /// Generation ID of the base DN, if any domain defined it yet.
    pub generation_id: Option<u64>,
    /// Newest change held per originating server.
    pub server_state: ServerState,
    /// Domains of the base DN currently connected.
    pub connected_domains: u32,
}

/// Session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMsg {
    /// Session opening (domain → server).
    Handshake(Handshake),
    /// Handshake answer (server → domain).
    HandshakeReply(HandshakeReply),
    /// One replicated change.
    Update(UpdateMsg),
    /// A replicated change whose origin waits for an [`AssuredAck`].
    AssuredUpdate {
        /// The change.
        update: UpdateMsg,
        /// Acknowledgment level.
        mode: AssuredMode,
    },
    /// Answer to an `AssuredUpdate`.
    Ack(AssuredAck),
    /// Server selection query (domain → server), answered then closed.
    ServerInfoRequest {
        /// Base DN the domain replicates.
        base_dn: Dn,
    },
    /// Answer to `ServerInfoRequest`.
    ServerInfo(ServerInfo),
    /// Keepalive sent when a side has nothing else to send.
    Heartbeat,
    /// Returns `credits` to the sender's window, with the acknowledging side's state.
    WindowAck {
        /// Updates processed since the last ack.
        credits: u32,
        /// Everything the acknowledging side has durably received.
        server_state: ServerState,
    },
    /// Status assigned to the domain by the server.
    StatusNotice(ReplicaStatus),
    /// Full export requested on behalf of `requester`.
    InitializeRequest {
        /// Domain to be reinitialized.
        requester: ServerId,
    },
    /// One chunk of a full export, addressed to `target`.
    InitializeEntries {
        /// Domain being reinitialized.
        target: ServerId,
        /// Stored keys of the exported base DN.
        entries: Vec<KvPair>,
    },
    /// End of a full export.
    InitializeDone {
        /// Domain being reinitialized.
        target: ServerId,
        /// Generation ID of the exported data.
        generation_id: u64,
        /// State of the exporting domain when the export was taken.
        server_state: ServerState,
    },
    /// A full export could not be produced or delivered.
    InitializeFailed {
        /// Domain that requested the export.
        target: ServerId,
        /// Human-readable cause.
        reason: String,
    },
    /// Orderly session close.
    Goodbye {
        /// Human-readable cause.
        reason: String,
    },
}

impl SessionMsg {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SessionMsg::Handshake(_) => "handshake",
            SessionMsg::HandshakeReply(_) => "handshake_reply",
            SessionMsg::Update(_) => "update",
            SessionMsg::AssuredUpdate { .. } => "assured_update",
            SessionMsg::Ack(_) => "ack",
            SessionMsg::ServerInfoRequest { .. } => "server_info_request",
            SessionMsg::ServerInfo(_) => "server_info",
            SessionMsg::Heartbeat => "heartbeat",
            SessionMsg::WindowAck { .. } => "window_ack",
            SessionMsg::StatusNotice(_) => "status_notice",
            SessionMsg::InitializeRequest { .. } => "initialize_request",
            SessionMsg::InitializeEntries { .. } => "initialize_entries",
            SessionMsg::InitializeDone { .. } => "initialize_done",
            SessionMsg::InitializeFailed { .. } => "initialize_failed",
            SessionMsg::Goodbye { .. } => "goodbye",
        }
    }

    /// True for traffic allowed in `BadGenId` and `FullUpdate`.
    pub fn is_full_update(&self) -> bool {
        matches!(
            self,
            SessionMsg::InitializeRequest { .. }
                | SessionMsg::InitializeEntries { .. }
                | SessionMsg::InitializeDone { .. }
                | SessionMsg::InitializeFailed { .. }
        )
    }
}

/// Administrative command sent to a running domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    /// Reinitialize the domain from a peer.
    ForceResync,
    /// Drop the current session and reconnect.
    ForceReconnect,
}
