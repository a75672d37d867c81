//! Per-connection replication status machine.
//!
//! ```text
//! NotConnected ─► Connecting ─► Handshaking ─┬─► Normal ◄──► Degraded
//!       ▲                                    ├─► FullUpdate
//!       │                                    └─► BadGenId
//!       └──────────── any state ◄── ToNotConnected
//! ```
//!
//! Every accepted transition is published as a [`StatusChange`] on a
//! broadcast channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::csn::{wall_clock_ms, ServerId};
use crate::dn::Dn;
use crate::error::{ReplError, Result};

/// Capacity of the status change channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Replication status of a domain, or of a domain as seen by its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// No session.
    NotConnected,
    /// Opening a transport connection.
    Connecting,
    /// Exchanging handshake messages.
    Handshaking,
    /// Exchanging updates.
    Normal,
    /// Exchanging updates with a large backlog, or after local apply failures.
    Degraded,
    /// Being reinitialized (or serving a reinitialization).
    FullUpdate,
    /// Data generation differs from the topology; only full-update traffic flows.
    BadGenId,
}

impl ReplicaStatus {
    /// Returns true if updates flow in this status.
    pub fn exchanges_updates(&self) -> bool {
        matches!(self, ReplicaStatus::Normal | ReplicaStatus::Degraded)
    }

    /// Returns true if a session exists in this status.
    pub fn is_connected(&self) -> bool {
        !matches!(self, ReplicaStatus::NotConnected | ReplicaStatus::Connecting)
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaStatus::NotConnected => "not_connected",
            ReplicaStatus::Connecting => "connecting",
            ReplicaStatus::Handshaking => "handshaking",
            ReplicaStatus::Normal => "normal",
            ReplicaStatus::Degraded => "degraded",
            ReplicaStatus::FullUpdate => "full_update",
            ReplicaStatus::BadGenId => "bad_gen_id",
        };
        f.write_str(s)
    }
}

/// Events driving the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// Start connecting.
    ToConnecting,
    /// Transport established, handshake begins.
    ToHandshaking,
    /// Handshake succeeded or backlog recovered.
    ToNormal,
    /// Backlog over threshold or local apply failing.
    ToDegraded,
    /// Full reinitialization begins.
    ToFullUpdate,
    /// Generation mismatch detected.
    ToBadGenId,
    /// Session lost or closed.
    ToNotConnected,
}

/// Computes the status reached from `from` on `event`, or `None` if invalid.
pub fn next_status(from: ReplicaStatus, event: StatusEvent) -> Option<ReplicaStatus> {
    use ReplicaStatus::*;
    use StatusEvent::*;

    match (from, event) {
        (_, ToNotConnected) => Some(NotConnected),
        (NotConnected, ToConnecting) => Some(Connecting),
        (Connecting, ToHandshaking) => Some(Handshaking),
        (Handshaking | Degraded | FullUpdate, ToNormal) => Some(Normal),
        (Handshaking | Normal, ToDegraded) => Some(Degraded),
        (Handshaking | Normal | Degraded | BadGenId, ToFullUpdate) => Some(FullUpdate),
        (Handshaking | Normal | Degraded, ToBadGenId) => Some(BadGenId),
        (Normal, ToNormal) => Some(Normal),
        (Degraded, ToDegraded) => Some(Degraded),
        (BadGenId, ToBadGenId) => Some(BadGenId),
        _ => None,
    }
}

/// A status transition, as broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Base DN of the domain.
    pub base_dn: Dn,
    /// Server whose status changed.
    pub server_id: ServerId,
    /// Previous status.
    pub from: ReplicaStatus,
    /// New status.
    pub to: ReplicaStatus,
    /// Wall-clock time of the change (ms since epoch).
    pub at_ms: i64,
}

/// Status of one domain (or one broker-side peer) with change notification.
#[derive(Debug)]
pub struct StatusMachine {
    base_dn: Dn,
    server_id: ServerId,
    status: parking_lot::Mutex<ReplicaStatus>,
    changes: broadcast::Sender<StatusChange>,
}

impl StatusMachine {
    /// Creates a machine in `NotConnected` publishing on `changes`.
    pub fn new(base_dn: Dn, server_id: ServerId, changes: broadcast::Sender<StatusChange>) -> Self {
        Self {
            base_dn,
            server_id,
            status: parking_lot::Mutex::new(ReplicaStatus::NotConnected),
            changes,
        }
    }

    /// Current status.
    pub fn status(&self) -> ReplicaStatus {
        *self.status.lock()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Applies `event`; a no-op transition publishes nothing.
    pub fn apply(&self, event: StatusEvent) -> Result<ReplicaStatus> {
        let change = {
            let mut status = self.status.lock();
            let from = *status;
            let to = next_status(from, event).ok_or_else(|| {
                ReplError::protocol(format!("invalid status transition from {from} on {event:?}"))
            })?;
            if to == from {
                return Ok(to);
            }
            *status = to;
            StatusChange {
                base_dn: self.base_dn.clone(),
                server_id: self.server_id,
                from,
                to,
                at_ms: wall_clock_ms(),
            }
        };
        tracing::info!(
            base_dn = %change.base_dn,
            server_id = %change.server_id,
            from = %change.from,
            to = %change.to,
            "replication status changed"
        );
        let to = change.to;
        // No receivers is fine.
        let _ = self.changes.send(change);
        Ok(to)
    }
}
