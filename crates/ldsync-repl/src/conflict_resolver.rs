//! Conflict resolution for multi-master replication.
//!
//! Decisions are pure functions of an entry's historical record and the
//! incoming change, so every replica that sees the same set of changes
//! reaches the same outcome regardless of arrival order:
//!
//! - attributes: last-write-wins per attribute, on CSN;
//! - delete vs modify: the entry is gone only while its newest delete is
//!   newer than every other change it received;
//! - naming: the claim with the lowest (CSN, entryUUID) keeps a DN.
//!
//! The resolver also keeps a bounded log of the conflicts it saw, for
//! operators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use crate::dn::Dn;
use crate::historical::{EntryHistorical, DELETE_ATTR, DN_ATTR};
use crate::update_msg::{AttrChange, EntryUuid, UpdateMsg, UpdatePayload};

/// Maximum number of conflict records retained.
pub const CONFLICT_LOG_CAPACITY: usize = 1024;

/// Types of conflicts observed while replaying changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    /// An attribute change lost against a newer one.
    AttributeSuperseded,
    /// A delete lost against newer changes; the entry survives.
    DeleteIgnored,
    /// A rename lost against a newer one.
    RenameSuperseded,
    /// An entry was displaced into the conflict container.
    NamingConflict,
    /// A displaced entry moved back to the DN it expected.
    ConflictCleared,
    /// An update arrived before the add of its entry.
    MissingEntry,
}

/// Record of one observed conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Entry involved.
    pub entry_uuid: EntryUuid,
    /// CSN of the change that triggered the conflict.
    pub csn: Csn,
    /// DN concerned (the expected DN for naming conflicts).
    pub dn: Dn,
    /// Conflict kind.
    pub conflict_type: ConflictType,
}

/// Outcome of resolving a modify against an entry's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeResolution {
    /// Changes that win, with their CSN.
    pub accepted: Vec<(AttrChange, Csn)>,
    /// Attributes whose change was superseded.
    pub superseded: Vec<String>,
}

impl AttributeResolution {
    /// Returns true if nothing is applied.
    pub fn is_noop(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Splits the attribute changes of `msg` into winners and losers.
///
/// A change wins when its CSN is newer than the CSN recorded for the
/// attribute. Add payloads count as one change per attribute.
pub fn resolve_attributes(history: &EntryHistorical, msg: &UpdateMsg) -> AttributeResolution {
    let changes: Vec<AttrChange> = match &msg.payload {
        UpdatePayload::Modify { changes, .. } => changes.clone(),
        UpdatePayload::Add { attributes } => attributes
            .iter()
            .map(|(attribute, values)| AttrChange {
                attribute: attribute.clone(),
                values: values.clone(),
            })
            .collect(),
        UpdatePayload::Delete | UpdatePayload::Rename { .. } => Vec::new(),
    };

    let mut resolution = AttributeResolution::default();
    for change in changes {
        let csn = msg.attribute_csn(&change.attribute);
        match history.get(&change.attribute) {
            Some(recorded) if recorded >= csn => resolution.superseded.push(change.attribute),
            _ => resolution.accepted.push((change, csn)),
        }
    }
    resolution
}

/// Returns true if a DN assignment at `csn` wins over the recorded one.
pub fn dn_assignment_wins(history: &EntryHistorical, csn: Csn) -> bool {
    history.get(DN_ATTR).map(|recorded| csn > recorded).unwrap_or(true)
}

/// Returns true if a delete at `csn` is newer than the recorded delete.
pub fn delete_is_newer(history: &EntryHistorical, csn: Csn) -> bool {
    history
        .get(DELETE_ATTR)
        .map(|recorded| csn > recorded)
        .unwrap_or(true)
}

/// Conflict log and counters shared by the replay tasks of one domain.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    log: Mutex<VecDeque<ConflictRecord>>,
    naming_conflicts: AtomicU64,
    total: AtomicU64,
}

impl ConflictResolver {
    /// Creates a new ConflictResolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a conflict and alerts when operator attention is useful.
    pub fn record(&self, record: ConflictRecord) {
        match record.conflict_type {
            ConflictType::NamingConflict => {
                self.naming_conflicts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    entry_uuid = %record.entry_uuid,
                    csn = %record.csn,
                    dn = %record.dn,
                    "naming conflict: entry moved to the conflict container"
                );
            }
            ConflictType::ConflictCleared => {
                tracing::info!(
                    entry_uuid = %record.entry_uuid,
                    dn = %record.dn,
                    "naming conflict cleared: entry restored to expected DN"
                );
            }
            ConflictType::DeleteIgnored => {
                tracing::warn!(
                    entry_uuid = %record.entry_uuid,
                    csn = %record.csn,
                    "delete older than surviving changes ignored"
                );
            }
            ConflictType::AttributeSuperseded
            | ConflictType::RenameSuperseded
            | ConflictType::MissingEntry => {
                tracing::debug!(
                    entry_uuid = %record.entry_uuid,
                    csn = %record.csn,
                    kind = ?record.conflict_type,
                    "conflict resolved"
                );
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut log = self.log.lock();
        if log.len() >= CONFLICT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Returns true if the conflict needs an operator.
    pub fn alert_needed(record: &ConflictRecord) -> bool {
        matches!(record.conflict_type, ConflictType::NamingConflict)
    }

    /// Retained records for one entry.
    pub fn conflicts_for_entry(&self, uuid: &EntryUuid) -> Vec<ConflictRecord> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.entry_uuid == *uuid)
            .cloned()
            .collect()
    }

    /// Retained records, oldest first.
    pub fn recent(&self) -> Vec<ConflictRecord> {
        self.log.lock().iter().cloned().collect()
    }

    /// Total number of conflicts seen.
    pub fn conflict_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of naming conflicts seen.
    pub fn naming_conflict_count(&self) -> u64 {
        self.naming_conflicts.load(Ordering::Relaxed)
    }
}
