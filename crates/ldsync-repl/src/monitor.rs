//! Operator-visible snapshots of domains and replication servers.

use serde::{Deserialize, Serialize};

use crate::csn::ServerId;
use crate::dn::Dn;
use crate::error::Result;
use crate::metrics::{Exposition, ReplicaLabels};
use crate::purge::PurgeStats;
use crate::server_state::ServerState;
use crate::status::ReplicaStatus;

/// Snapshot of one replication domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMonitor {
    /// Replicated base DN.
    pub base_dn: Dn,
    /// Server ID of this replica.
    pub server_id: ServerId,
    /// Current status.
    pub status: ReplicaStatus,
    /// Replication server of the current session.
    pub connected_to: Option<String>,
    /// Generation ID of the local data.
    pub generation_id: u64,
    /// Everything this replica has seen.
    pub server_state: ServerState,
    /// Updates waiting for their entry's add.
    pub pending_updates: usize,
    /// Entries currently held in the conflict subtree.
    pub naming_conflicts: usize,
    /// Conflicts resolved since start.
    pub conflicts_total: u64,
    /// Local changes published.
    pub updates_published: u64,
    /// Updates received from the replication server.
    pub updates_received: u64,
    /// Local and received updates that changed local data.
    pub updates_applied: u64,
    /// Received updates already covered or superseded.
    pub updates_dropped: u64,
    /// Updates whose local apply failed after retries.
    pub apply_failures: u64,
    /// Full updates imported.
    pub full_updates: u64,
    /// Sessions opened.
    pub sessions: u64,
    /// Local changes published in assured mode.
    pub assured_updates: u64,
    /// Assured changes acknowledged with an error, or not within the timeout.
    pub assured_failures: u64,
}

impl DomainMonitor {
    /// Adds the samples of this domain to `out`.
    pub fn record_metrics(&self, out: &mut Exposition) {
        let labels = || ReplicaLabels::new(&self.base_dn, self.server_id);
        out.gauge(
            "ldsync_domain_status",
            "Current replication status of the domain",
            labels().status(self.status),
            1,
        );
        out.gauge(
            "ldsync_domain_pending_updates",
            "Updates waiting for their entry's add",
            labels(),
            self.pending_updates as u64,
        );
        out.gauge(
            "ldsync_domain_naming_conflicts",
            "Entries held in the conflict subtree",
            labels(),
            self.naming_conflicts as u64,
        );
        let counters = [
            ("ldsync_domain_conflicts_total", "Conflicts resolved", self.conflicts_total),
            ("ldsync_domain_updates_published_total", "Local changes published", self.updates_published),
            (
                "ldsync_domain_updates_received_total",
                "Updates received from the replication server",
                self.updates_received,
            ),
            (
                "ldsync_domain_updates_applied_total",
                "Local and received updates that changed local data",
                self.updates_applied,
            ),
            (
                "ldsync_domain_updates_dropped_total",
                "Received updates already covered or superseded",
                self.updates_dropped,
            ),
            (
                "ldsync_domain_apply_failures_total",
                "Updates whose local apply failed after retries",
                self.apply_failures,
            ),
            ("ldsync_domain_full_updates_total", "Full updates imported", self.full_updates),
            ("ldsync_domain_sessions_total", "Sessions opened", self.sessions),
            (
                "ldsync_domain_assured_updates_total",
                "Local changes published in assured mode",
                self.assured_updates,
            ),
            (
                "ldsync_domain_assured_failures_total",
                "Assured changes acknowledged with an error or not at all",
                self.assured_failures,
            ),
        ];
        for (name, help, value) in counters {
            out.counter(name, help, labels(), value);
        }
    }

    /// Prometheus text exposition.
    pub fn format_prometheus(&self) -> String {
        let mut out = Exposition::new();
        self.record_metrics(&mut out);
        out.render()
    }

    /// JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::ReplError::Protocol {
            msg: e.to_string(),
        })
    }
}

/// A domain as seen by its replication server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMonitor {
    /// Server ID of the domain.
    pub server_id: ServerId,
    /// Group announced by the domain.
    pub group_id: u8,
    /// Status assigned by the replication server.
    pub status: ReplicaStatus,
    /// Generation ID announced by the domain.
    pub generation_id: u64,
    /// Changelog records the domain has not received yet.
    pub backlog: u64,
    /// Last state acknowledged by the domain.
    pub acked_state: ServerState,
    /// Updates received from the domain.
    pub updates_received: u64,
    /// Updates relayed to the domain.
    pub updates_sent: u64,
}

/// Snapshot of one base DN on a replication server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDomainMonitor {
    /// Base DN.
    pub base_dn: Dn,
    /// Server ID of the replication server.
    pub server_id: ServerId,
    /// Generation ID of the topology, once known.
    pub generation_id: Option<u64>,
    /// Newest change held per originating server.
    pub server_state: ServerState,
    /// Records held in the changelog for this base DN.
    pub changelog_records: u64,
    /// Connected domains.
    pub peers: Vec<PeerMonitor>,
    /// Purge activity of the changelog.
    pub purge: PurgeStats,
    /// Safe-read updates waiting for acknowledgments.
    pub assured_waiting: usize,
    /// Assured updates answered.
    pub assured_acks: u64,
    /// Safe-read updates answered with a timeout.
    pub assured_timeouts: u64,
}

impl BrokerDomainMonitor {
    /// Adds the samples of this base DN and its peers to `out`.
    pub fn record_metrics(&self, out: &mut Exposition) {
        let labels = || ReplicaLabels::new(&self.base_dn, self.server_id);
        out.gauge(
            "ldsync_broker_changelog_records",
            "Records held in the changelog",
            labels(),
            self.changelog_records,
        );
        out.gauge(
            "ldsync_broker_connected_peers",
            "Connected domains",
            labels(),
            self.peers.len() as u64,
        );
        out.gauge(
            "ldsync_broker_assured_waiting",
            "Safe-read updates waiting for acknowledgments",
            labels(),
            self.assured_waiting as u64,
        );
        out.counter(
            "ldsync_broker_records_purged_total",
            "Changelog records purged",
            labels(),
            self.purge.records_purged,
        );
        out.counter(
            "ldsync_broker_assured_acks_total",
            "Assured updates answered",
            labels(),
            self.assured_acks,
        );
        out.counter(
            "ldsync_broker_assured_timeouts_total",
            "Safe-read updates answered with a timeout",
            labels(),
            self.assured_timeouts,
        );
        for peer in &self.peers {
            let peer_labels = || labels().peer(peer.server_id);
            out.gauge(
                "ldsync_broker_peer_status",
                "Status assigned to a connected domain",
                peer_labels().status(peer.status),
                1,
            );
            out.gauge(
                "ldsync_broker_peer_backlog",
                "Changelog records a domain has not received",
                peer_labels(),
                peer.backlog,
            );
            out.counter(
                "ldsync_broker_peer_updates_received_total",
                "Updates received from a domain",
                peer_labels(),
                peer.updates_received,
            );
            out.counter(
                "ldsync_broker_peer_updates_sent_total",
                "Updates relayed to a domain",
                peer_labels(),
                peer.updates_sent,
            );
        }
    }

    /// Prometheus text exposition.
    pub fn format_prometheus(&self) -> String {
        let mut out = Exposition::new();
        self.record_metrics(&mut out);
        out.render()
    }

    /// JSON form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::ReplError::Protocol {
            msg: e.to_string(),
        })
    }
}
