//! Changelog purge bookkeeping.
//!
//! A record may only be purged once every peer that could still need it has
//! acknowledged it. Peers acknowledge with their ServerState; the purge
//! watermark of a partition is the minimum, over every known peer of the
//! base DN, of the CSN that peer acknowledged for the partition's server.
//! A known peer that never acknowledged anything for that server pins the
//! watermark (no purge at all).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::csn::{Csn, ServerId};
use crate::server_state::ServerState;

/// Latest acknowledgment received from one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    /// The acknowledging peer.
    pub peer: ServerId,
    /// Everything the peer has durably received.
    pub state: ServerState,
    /// Wall-clock time of the acknowledgment (ms since epoch).
    pub acked_at_ms: i64,
}

/// Statistics from purge runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeStats {
    /// Total records removed.
    pub records_purged: u64,
    /// Number of purge runs performed.
    pub purge_runs: u64,
    /// Time of the last run (ms since epoch).
    pub last_purge_ms: i64,
}

#[derive(Debug, Default)]
struct DomainAcks {
    known_peers: BTreeSet<ServerId>,
    acks: BTreeMap<ServerId, AckRecord>,
}

/// Acknowledgment state of every base DN of one changelog.
///
/// Base DNs are keyed by their normalized index key.
#[derive(Debug, Default)]
pub struct PurgeTracker {
    domains: HashMap<String, DomainAcks>,
    stats: PurgeStats,
}

impl PurgeTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `peer` as a consumer of `base`; its acks now gate purging.
    pub fn register_peer(&mut self, base: &str, peer: ServerId) {
        self.domains
            .entry(base.to_string())
            .or_default()
            .known_peers
            .insert(peer);
    }

    /// Stops waiting for `peer` (administrative removal).
    pub fn forget_peer(&mut self, base: &str, peer: ServerId) {
        if let Some(domain) = self.domains.get_mut(base) {
            domain.known_peers.remove(&peer);
            domain.acks.remove(&peer);
        }
    }

    /// Merges an acknowledgment of `peer`; acknowledged CSNs never move back.
    ///
    /// Returns the merged state.
    pub fn record_ack(
        &mut self,
        base: &str,
        peer: ServerId,
        state: &ServerState,
        now_ms: i64,
    ) -> ServerState {
        let domain = self.domains.entry(base.to_string()).or_default();
        domain.known_peers.insert(peer);
        let record = domain.acks.entry(peer).or_insert_with(|| AckRecord {
            peer,
            state: ServerState::new(),
            acked_at_ms: now_ms,
        });
        record.state.update_all(state);
        record.acked_at_ms = now_ms;
        record.state.clone()
    }

    /// Acknowledgment of `peer`, if any.
    pub fn get_ack(&self, base: &str, peer: ServerId) -> Option<&AckRecord> {
        self.domains.get(base)?.acks.get(&peer)
    }

    /// Known peers of `base`.
    pub fn known_peers(&self, base: &str) -> Vec<ServerId> {
        self.domains
            .get(base)
            .map(|d| d.known_peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Purge watermark of the partition of `server` under `base`.
    ///
    /// `None` when no peer is known or some known peer has not acknowledged
    /// anything from `server`.
    pub fn watermark(&self, base: &str, server: ServerId) -> Option<Csn> {
        let domain = self.domains.get(base)?;
        let mut min_csn: Option<Csn> = None;
        for peer in &domain.known_peers {
            let acked = domain.acks.get(peer)?.state.max_csn(server)?;
            min_csn = Some(match min_csn {
                None => acked,
                Some(m) => m.min(acked),
            });
        }
        min_csn
    }

    /// Forgets everything about `base`.
    pub fn clear(&mut self, base: &str) {
        self.domains.remove(base);
    }

    /// Accounts one purge run.
    pub fn record_run(&mut self, purged: usize, now_ms: i64) {
        self.stats.purge_runs += 1;
        self.stats.records_purged += purged as u64;
        self.stats.last_purge_ms = now_ms;
    }

    /// Purge statistics.
    pub fn stats(&self) -> &PurgeStats {
        &self.stats
    }
}
