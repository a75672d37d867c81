//! ServerState: the latest CSN seen from every server of one base DN.
//!
//! A ServerState only moves forward. It answers two questions: "is this
//! change a replay of something already applied?" and, exchanged at
//! handshake, "which changes is my peer missing?".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::csn::{Csn, ServerId};
use crate::dn::Dn;

/// Identifies one replica of one naming context.
///
/// Ordered by base DN, then server id. Used as the changelog partition key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    /// Replicated naming context.
    pub base_dn: Dn,
    /// Server that originates the changes.
    pub server_id: ServerId,
}

impl ReplicaId {
    /// Creates a new replica id.
    pub fn new(base_dn: Dn, server_id: ServerId) -> Self {
        Self { base_dn, server_id }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.base_dn)
    }
}

/// Mapping server id → latest CSN received from that server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<ServerId, Csn>,
}

impl ServerState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` if it is newer than what is known for its server.
    ///
    /// Returns true if the state changed.
    pub fn update(&mut self, csn: &Csn) -> bool {
        match self.csns.get(&csn.server_id()) {
            Some(known) if known >= csn => false,
            _ => {
                self.csns.insert(csn.server_id(), *csn);
                true
            }
        }
    }

    /// Merges every entry of `other` into `self` (entry-wise maximum).
    pub fn update_all(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.csns.values() {
            changed |= self.update(csn);
        }
        changed
    }

    /// Returns true if `csn` is not newer than what was already seen from its server.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.server_id())
            .map(|known| known >= csn)
            .unwrap_or(false)
    }

    /// Latest CSN received from `server_id`.
    pub fn max_csn(&self, server_id: ServerId) -> Option<Csn> {
        self.csns.get(&server_id).copied()
    }

    /// Returns true if every entry of `self` is ≤ the corresponding entry of `other`.
    pub fn is_evenly_covered_by(&self, other: &ServerState) -> bool {
        self.csns.iter().all(|(sid, csn)| {
            other
                .csns
                .get(sid)
                .map(|theirs| theirs >= csn)
                .unwrap_or(false)
        })
    }

    /// For every server where `other` is behind `self`, the CSN `other` has
    /// reached (`None` when it has seen nothing from that server).
    ///
    /// These are the start points from which `other` must be sent changes.
    pub fn missing_in(&self, other: &ServerState) -> Vec<(ServerId, Option<Csn>)> {
        self.csns
            .iter()
            .filter_map(|(sid, csn)| match other.csns.get(sid) {
                Some(theirs) if theirs >= csn => None,
                theirs => Some((*sid, theirs.copied())),
            })
            .collect()
    }

    /// Server ids with at least one CSN.
    pub fn server_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.csns.keys().copied()
    }

    /// All (server id, CSN) pairs in server id order.
    pub fn iter(&self) -> impl Iterator<Item = (ServerId, Csn)> + '_ {
        self.csns.iter().map(|(sid, csn)| (*sid, *csn))
    }

    /// Number of servers tracked.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Returns true if nothing was seen yet.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Forgets everything (full reinitialization only).
    pub fn clear(&mut self) {
        self.csns.clear();
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.csns.values().map(|c| c.to_string()).collect();
        write!(f, "[{}]", parts.join(" "))
    }
}
