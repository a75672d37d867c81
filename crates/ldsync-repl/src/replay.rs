//! Replay engine: applies update messages to the entry store.
//!
//! Local and remote changes go through the same path so every replica stores
//! byte-identical state for the same set of changes. Updates on one
//! entryUUID are serialized by a per-entry async mutex; naming settlement is
//! serialized by one mutex per domain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::conflict_resolver::{
    delete_is_newer, dn_assignment_wins, resolve_attributes, ConflictRecord, ConflictResolver,
    ConflictType,
};
use crate::csn::Csn;
use crate::dn::Dn;
use crate::entry_store::{Claim, ClaimOp, EntryStore, EntryWrite, StoredEntry};
use crate::error::Result;
use crate::historical::{DELETE_ATTR, DN_ATTR};
use crate::pending::PendingUpdates;
use crate::update_msg::{Attributes, EntryUuid, OperationKind, UpdateMsg, UpdatePayload};

/// Result of replaying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayOutcome {
    /// The update changed the entry.
    Applied,
    /// The update lost every comparison and changed nothing.
    Dropped,
    /// The entry is unknown; the update waits for its add.
    Pending,
    /// The update was applied and left its entry in the conflict container.
    Conflict,
}

/// Replay counters.
#[derive(Debug, Default)]
pub struct ReplayStats {
    applied: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicU64,
    conflicts: AtomicU64,
}

/// Snapshot of [`ReplayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStatsSnapshot {
    /// Updates applied.
    pub applied: u64,
    /// Updates dropped as superseded.
    pub dropped: u64,
    /// Updates buffered for a missing entry.
    pub pending: u64,
    /// Updates that ended in a naming conflict.
    pub conflicts: u64,
}

impl ReplayStats {
    fn count(&self, outcome: ReplayOutcome) {
        let counter = match outcome {
            ReplayOutcome::Applied => &self.applied,
            ReplayOutcome::Dropped => &self.dropped,
            ReplayOutcome::Pending => &self.pending,
            ReplayOutcome::Conflict => &self.conflicts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> ReplayStatsSnapshot {
        ReplayStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Applies updates of one base DN.
pub struct ReplayEngine {
    store: EntryStore,
    resolver: ConflictResolver,
    pending: parking_lot::Mutex<PendingUpdates>,
    entry_locks: DashMap<EntryUuid, Arc<Mutex<()>>>,
    naming: Mutex<()>,
    stats: ReplayStats,
}

impl ReplayEngine {
    /// Creates an engine over `store` buffering at most `pending_capacity` early updates.
    pub fn new(store: EntryStore, pending_capacity: usize) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(),
            pending: parking_lot::Mutex::new(PendingUpdates::new(pending_capacity)),
            entry_locks: DashMap::new(),
            naming: Mutex::new(()),
            stats: ReplayStats::default(),
        }
    }

    /// Entry store.
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Conflict log.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Counters.
    pub fn stats(&self) -> ReplayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of updates waiting for their add.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drops every pending update (full reinitialization).
    pub fn clear_pending(&self) {
        self.pending.lock().clear();
    }

    fn entry_lock(&self, uuid: EntryUuid) -> Arc<Mutex<()>> {
        self.entry_locks
            .entry(uuid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_entry_lock(&self, uuid: &EntryUuid) {
        self.entry_locks
            .remove_if(uuid, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Applies `msg`, then any update that was waiting for it.
    ///
    /// Fails with [`crate::error::ReplError::ConflictOverflow`] when the
    /// pending buffer is full.
    pub async fn apply(&self, msg: &UpdateMsg) -> Result<ReplayOutcome> {
        let uuid = msg.entry_uuid;
        let lock = self.entry_lock(uuid);
        let result = {
            let _guard = lock.lock().await;
            self.apply_with_waiting(msg).await
        };
        drop(lock);
        self.release_entry_lock(&uuid);
        result
    }

    /// Builds an update from the stored state of `uuid` and applies it,
    /// both under the entry lock (local changes).
    pub async fn apply_built<F>(&self, uuid: EntryUuid, build: F) -> Result<(UpdateMsg, ReplayOutcome)>
    where
        F: FnOnce(Option<&StoredEntry>) -> Result<UpdateMsg>,
    {
        let lock = self.entry_lock(uuid);
        let result = async {
            let _guard = lock.lock().await;
            let current = self.store.get(&uuid)?;
            let msg = build(current.as_ref())?;
            let outcome = self.apply_with_waiting(&msg).await?;
            Ok((msg, outcome))
        }
        .await;
        drop(lock);
        self.release_entry_lock(&uuid);
        result
    }

    async fn apply_with_waiting(&self, msg: &UpdateMsg) -> Result<ReplayOutcome> {
        let outcome = self.apply_locked(msg).await?;
        self.stats.count(outcome);
        if msg.kind() == OperationKind::Add && outcome != ReplayOutcome::Pending {
            let waiting = self.pending.lock().take(&msg.entry_uuid);
            for queued in waiting {
                debug!(entry_uuid = %queued.entry_uuid, csn = %queued.csn, "replaying pending update");
                let queued_outcome = self.apply_locked(&queued).await?;
                self.stats.count(queued_outcome);
            }
        }
        Ok(outcome)
    }

    async fn apply_locked(&self, msg: &UpdateMsg) -> Result<ReplayOutcome> {
        let uuid = msg.entry_uuid;
        let previous = self.store.get(&uuid)?;
        let (mut entry, exists) = match previous.clone() {
            Some(entry) => (entry, true),
            None => match msg.payload {
                UpdatePayload::Add { .. } => (
                    StoredEntry {
                        uuid,
                        expected_dn: msg.dn.clone(),
                        attributes: Attributes::new(),
                        tombstone: true,
                    },
                    false,
                ),
                _ => {
                    self.pending.lock().push(msg.clone())?;
                    self.resolver.record(ConflictRecord {
                        entry_uuid: uuid,
                        csn: msg.csn,
                        dn: msg.dn.clone(),
                        conflict_type: ConflictType::MissingEntry,
                    });
                    return Ok(ReplayOutcome::Pending);
                }
            },
        };

        let mut history = self.store.historical(&uuid)?;
        let was_live = exists && !entry.tombstone;
        let old_expected = entry.expected_dn.clone();
        let old_dn_csn = history.dn_csn();
        let mut rows: Vec<(String, Csn)> = Vec::new();

        let resolution = resolve_attributes(&history, msg);
        for attribute in resolution.superseded {
            debug!(entry_uuid = %uuid, csn = %msg.csn, attribute = %attribute, "attribute change superseded");
            self.resolver.record(ConflictRecord {
                entry_uuid: uuid,
                csn: msg.csn,
                dn: msg.dn.clone(),
                conflict_type: ConflictType::AttributeSuperseded,
            });
        }
        for (change, csn) in resolution.accepted {
            if change.values.is_empty() {
                entry.attributes.remove(&change.attribute);
            } else {
                entry
                    .attributes
                    .insert(change.attribute.clone(), change.values);
            }
            history.record(&change.attribute, csn);
            rows.push((change.attribute, csn));
        }

        match &msg.payload {
            UpdatePayload::Add { .. } => {
                if dn_assignment_wins(&history, msg.csn) {
                    entry.expected_dn = msg.dn.clone();
                    history.record(DN_ATTR, msg.csn);
                    rows.push((DN_ATTR.to_string(), msg.csn));
                }
            }
            UpdatePayload::Rename { new_dn } => {
                if dn_assignment_wins(&history, msg.csn) {
                    entry.expected_dn = new_dn.clone();
                    history.record(DN_ATTR, msg.csn);
                    rows.push((DN_ATTR.to_string(), msg.csn));
                } else {
                    self.resolver.record(ConflictRecord {
                        entry_uuid: uuid,
                        csn: msg.csn,
                        dn: new_dn.clone(),
                        conflict_type: ConflictType::RenameSuperseded,
                    });
                }
            }
            UpdatePayload::Delete => {
                if delete_is_newer(&history, msg.csn) {
                    history.record(DELETE_ATTR, msg.csn);
                    rows.push((DELETE_ATTR.to_string(), msg.csn));
                }
            }
            UpdatePayload::Modify { .. } => {}
        }

        if rows.is_empty() {
            return Ok(ReplayOutcome::Dropped);
        }

        let live = history.is_live();
        if msg.kind() == OperationKind::Delete && live {
            self.resolver.record(ConflictRecord {
                entry_uuid: uuid,
                csn: msg.csn,
                dn: entry.expected_dn.clone(),
                conflict_type: ConflictType::DeleteIgnored,
            });
        }
        entry.tombstone = !live;

        let naming_changed = was_live != live
            || old_expected != entry.expected_dn
            || old_dn_csn != history.dn_csn();
        let new_expected = entry.expected_dn.clone();
        let mut claims = Vec::new();
        if naming_changed {
            if was_live {
                claims.push(ClaimOp::Remove {
                    uuid,
                    dn: old_expected.clone(),
                });
            }
            if live {
                claims.push(ClaimOp::Put {
                    uuid,
                    claim: Claim {
                        csn: history.dn_csn().unwrap_or(msg.csn),
                        dn: new_expected.clone(),
                    },
                });
            }
        }

        let write = EntryWrite {
            previous,
            entry,
            historical: rows,
            claims,
            unplace: was_live && !live,
        };
        if !naming_changed {
            self.store.commit(&write)?;
            return Ok(ReplayOutcome::Applied);
        }

        let _naming = self.naming.lock().await;
        self.store.commit(&write)?;
        if live {
            self.settle(&new_expected, msg.csn)?;
        }
        if was_live && (!live || old_expected.index_key() != new_expected.index_key()) {
            self.settle(&old_expected, msg.csn)?;
        }
        if !live {
            debug!(entry_uuid = %uuid, csn = %msg.csn, "entry tombstoned");
            return Ok(ReplayOutcome::Applied);
        }
        match self.store.placement(&uuid)? {
            Some(placement) if placement.conflict => Ok(ReplayOutcome::Conflict),
            Some(_) => Ok(ReplayOutcome::Applied),
            None => {
                warn!(entry_uuid = %uuid, dn = %new_expected, "live entry left without placement");
                Ok(ReplayOutcome::Applied)
            }
        }
    }

    fn settle(&self, dn: &Dn, csn: Csn) -> Result<()> {
        for change in self.store.settle(dn)? {
            let was_conflict = change.previous.as_ref().map(|p| p.conflict).unwrap_or(false);
            if change.current.conflict {
                self.resolver.record(ConflictRecord {
                    entry_uuid: change.uuid,
                    csn,
                    dn: dn.clone(),
                    conflict_type: ConflictType::NamingConflict,
                });
            } else if was_conflict {
                self.resolver.record(ConflictRecord {
                    entry_uuid: change.uuid,
                    csn,
                    dn: dn.clone(),
                    conflict_type: ConflictType::ConflictCleared,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::csn::ServerId;
    use crate::error::ReplError;
    use crate::update_msg::AttrChange;
    use std::collections::BTreeMap;

    fn engine() -> ReplayEngine {
        let store = EntryStore::new(Arc::new(MemoryBackend::new()), Dn::new("dc=example"));
        ReplayEngine::new(store, 16)
    }

    fn csn(ts: i64, sid: u32) -> Csn {
        Csn::new(ts, ServerId::new(sid), 0)
    }

    fn add(id: u128, dn: &str, at: Csn, cn: &str) -> UpdateMsg {
        let mut attributes = Attributes::new();
        attributes.insert("cn".into(), vec![cn.into()]);
        UpdateMsg {
            csn: at,
            entry_uuid: EntryUuid::from_u128(id),
            dn: Dn::new(dn),
            payload: UpdatePayload::Add { attributes },
        }
    }

    fn modify(id: u128, at: Csn, attribute: &str, values: &[&str]) -> UpdateMsg {
        UpdateMsg {
            csn: at,
            entry_uuid: EntryUuid::from_u128(id),
            dn: Dn::new("cn=x,dc=example"),
            payload: UpdatePayload::Modify {
                changes: vec![AttrChange {
                    attribute: attribute.into(),
                    values: values.iter().map(|v| v.to_string()).collect(),
                }],
                historical: BTreeMap::from([(attribute.to_string(), at)]),
            },
        }
    }

    fn delete(id: u128, at: Csn) -> UpdateMsg {
        UpdateMsg {
            csn: at,
            entry_uuid: EntryUuid::from_u128(id),
            dn: Dn::new("cn=x,dc=example"),
            payload: UpdatePayload::Delete,
        }
    }

    fn rename(id: u128, at: Csn, new_dn: &str) -> UpdateMsg {
        UpdateMsg {
            csn: at,
            entry_uuid: EntryUuid::from_u128(id),
            dn: Dn::new("cn=x,dc=example"),
            payload: UpdatePayload::Rename {
                new_dn: Dn::new(new_dn),
            },
        }
    }

    #[tokio::test]
    async fn test_add_then_lookup() {
        let engine = engine();
        let outcome = engine
            .apply(&add(1, "cn=a,dc=example", csn(1, 1), "a"))
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Applied);
        let entry = engine
            .store()
            .find(&Dn::new("cn=a,dc=example"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.attributes["cn"], vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let engine = engine();
        let msg = add(1, "cn=a,dc=example", csn(1, 1), "a");
        engine.apply(&msg).await.unwrap();
        let before = engine.store().export().unwrap();
        assert_eq!(engine.apply(&msg).await.unwrap(), ReplayOutcome::Dropped);
        assert_eq!(engine.store().export().unwrap(), before);
    }

    #[tokio::test]
    async fn test_attribute_lww_both_orders() {
        for order in [[0usize, 1], [1, 0]] {
            let engine = engine();
            engine
                .apply(&add(1, "cn=a,dc=example", csn(1, 1), "x"))
                .await
                .unwrap();
            let msgs = [
                modify(1, csn(100, 1), "cn", &["Alice"]),
                modify(1, csn(100, 2), "cn", &["Alicia"]),
            ];
            for idx in order {
                engine.apply(&msgs[idx]).await.unwrap();
            }
            let entry = engine
                .store()
                .find_uuid(&EntryUuid::from_u128(1))
                .unwrap()
                .unwrap();
            assert_eq!(entry.attributes["cn"], vec!["Alicia".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_older_delete_keeps_entry() {
        let engine = engine();
        engine
            .apply(&add(1, "cn=a,dc=example", csn(10, 1), "a"))
            .await
            .unwrap();
        engine
            .apply(&modify(1, csn(60, 2), "mail", &["a@x"]))
            .await
            .unwrap();
        let outcome = engine.apply(&delete(1, csn(50, 1))).await.unwrap();
        assert_eq!(outcome, ReplayOutcome::Applied);
        assert!(engine
            .store()
            .find_uuid(&EntryUuid::from_u128(1))
            .unwrap()
            .is_some());
        assert_eq!(
            engine
                .resolver()
                .conflicts_for_entry(&EntryUuid::from_u128(1))
                .last()
                .map(|r| r.conflict_type),
            Some(ConflictType::DeleteIgnored)
        );
    }

    #[tokio::test]
    async fn test_newer_delete_tombstones_and_newer_modify_revives() {
        let engine = engine();
        let dn = Dn::new("cn=a,dc=example");
        engine
            .apply(&add(1, "cn=a,dc=example", csn(10, 1), "a"))
            .await
            .unwrap();
        engine.apply(&delete(1, csn(20, 1))).await.unwrap();
        assert!(engine.store().find(&dn).unwrap().is_none());
        assert!(engine
            .store()
            .get(&EntryUuid::from_u128(1))
            .unwrap()
            .unwrap()
            .tombstone);

        engine
            .apply(&modify(1, csn(30, 2), "sn", &["b"]))
            .await
            .unwrap();
        let revived = engine.store().find(&dn).unwrap().unwrap();
        assert_eq!(revived.attributes["sn"], vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_naming_conflict_and_clear() {
        let engine = engine();
        let dn = Dn::new("cn=bob,dc=example");
        assert_eq!(
            engine
                .apply(&add(1, "cn=bob,dc=example", csn(10, 1), "bob"))
                .await
                .unwrap(),
            ReplayOutcome::Applied
        );
        assert_eq!(
            engine
                .apply(&add(2, "cn=bob,dc=example", csn(20, 2), "bob"))
                .await
                .unwrap(),
            ReplayOutcome::Conflict
        );
        assert_eq!(
            engine.store().find(&dn).unwrap().unwrap().uuid,
            EntryUuid::from_u128(1)
        );

        engine.apply(&delete(1, csn(30, 1))).await.unwrap();
        let owner = engine.store().find(&dn).unwrap().unwrap();
        assert_eq!(owner.uuid, EntryUuid::from_u128(2));
        assert!(owner.conflict_of.is_none());
    }

    #[tokio::test]
    async fn test_rename_away_clears_conflict() {
        let engine = engine();
        engine
            .apply(&add(1, "cn=bob,dc=example", csn(10, 1), "bob"))
            .await
            .unwrap();
        engine
            .apply(&add(2, "cn=bob,dc=example", csn(20, 2), "bob"))
            .await
            .unwrap();
        engine
            .apply(&rename(1, csn(30, 1), "cn=robert,dc=example"))
            .await
            .unwrap();
        let store = engine.store();
        assert_eq!(
            store
                .find(&Dn::new("cn=bob,dc=example"))
                .unwrap()
                .unwrap()
                .uuid,
            EntryUuid::from_u128(2)
        );
        assert_eq!(
            store
                .find(&Dn::new("cn=robert,dc=example"))
                .unwrap()
                .unwrap()
                .uuid,
            EntryUuid::from_u128(1)
        );
        assert_eq!(store.conflict_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_rename_superseded() {
        let engine = engine();
        engine
            .apply(&add(1, "cn=a,dc=example", csn(10, 1), "a"))
            .await
            .unwrap();
        engine
            .apply(&rename(1, csn(30, 1), "cn=b,dc=example"))
            .await
            .unwrap();
        let outcome = engine
            .apply(&rename(1, csn(20, 2), "cn=c,dc=example"))
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Dropped);
        assert!(engine
            .store()
            .find(&Dn::new("cn=b,dc=example"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_modify_before_add_waits() {
        let engine = engine();
        let outcome = engine
            .apply(&modify(1, csn(20, 2), "sn", &["late"]))
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Pending);
        assert_eq!(engine.pending_len(), 1);

        engine
            .apply(&add(1, "cn=a,dc=example", csn(10, 1), "a"))
            .await
            .unwrap();
        assert_eq!(engine.pending_len(), 0);
        let entry = engine
            .store()
            .find_uuid(&EntryUuid::from_u128(1))
            .unwrap()
            .unwrap();
        assert_eq!(entry.attributes["sn"], vec!["late".to_string()]);
        assert_eq!(engine.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_pending_overflow() {
        let store = EntryStore::new(Arc::new(MemoryBackend::new()), Dn::new("dc=example"));
        let engine = ReplayEngine::new(store, 1);
        engine.apply(&delete(1, csn(1, 1))).await.unwrap();
        let err = engine.apply(&delete(2, csn(2, 1))).await.unwrap_err();
        assert!(matches!(err, ReplError::ConflictOverflow { capacity: 1 }));
    }

    #[tokio::test]
    async fn test_entry_locks_released() {
        let engine = engine();
        engine
            .apply(&add(1, "cn=a,dc=example", csn(1, 1), "a"))
            .await
            .unwrap();
        assert!(engine.entry_locks.is_empty());
    }
    #[tokio::test]
    async fn test_apply_built_sees_current_entry() {
        let engine = engine();
        engine
            .apply(&add(1, "cn=a,dc=example", csn(1, 1), "a"))
            .await
            .unwrap();
        let (msg, outcome) = engine
            .apply_built(EntryUuid::from_u128(1), |current| {
                let current = current.expect("entry exists");
                assert_eq!(current.attributes["cn"], vec!["a".to_string()]);
                Ok(modify(1, csn(2, 1), "cn", &["b"]))
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Applied);
        assert_eq!(msg.csn, csn(2, 1));
        assert!(engine.entry_locks.is_empty());

        let err = engine
            .apply_built(EntryUuid::from_u128(9), |_| {
                Err(ReplError::NoSuchEntry {
                    target: "cn=z".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::NoSuchEntry { .. }));
        assert!(engine.entry_locks.is_empty());
    }
}
