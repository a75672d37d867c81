//! Bounded buffer of updates waiting for the add of their entry.
//!
//! A modify, delete or rename can overtake the add of its entry when the two
//! come from different servers. Such updates wait here, keyed by entryUUID,
//! and are replayed in CSN order once the add is applied. The buffer is not
//! persisted; overflowing it means the replica can no longer be trusted to
//! converge incrementally and must be reinitialized.

use std::collections::HashMap;

use crate::error::{ReplError, Result};
use crate::update_msg::{EntryUuid, UpdateMsg};

/// Default maximum number of buffered updates.
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;

/// Updates waiting for their entry to exist.
#[derive(Debug)]
pub struct PendingUpdates {
    capacity: usize,
    by_entry: HashMap<EntryUuid, Vec<UpdateMsg>>,
    len: usize,
}

impl PendingUpdates {
    /// Creates an empty buffer holding at most `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            by_entry: HashMap::new(),
            len: 0,
        }
    }

    /// Buffers `msg`. Duplicates (same CSN) are ignored.
    pub fn push(&mut self, msg: UpdateMsg) -> Result<()> {
        let queue = self.by_entry.entry(msg.entry_uuid).or_default();
        if queue.iter().any(|m| m.csn == msg.csn) {
            return Ok(());
        }
        if self.len >= self.capacity {
            if queue.is_empty() {
                self.by_entry.remove(&msg.entry_uuid);
            }
            return Err(ReplError::ConflictOverflow {
                capacity: self.capacity,
            });
        }
        queue.push(msg);
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the updates waiting for `uuid`, oldest CSN first.
    pub fn take(&mut self, uuid: &EntryUuid) -> Vec<UpdateMsg> {
        let mut msgs = self.by_entry.remove(uuid).unwrap_or_default();
        self.len -= msgs.len();
        msgs.sort_by_key(|m| m.csn);
        msgs
    }

    /// Number of buffered updates.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct entries waited for.
    pub fn entry_count(&self) -> usize {
        self.by_entry.len()
    }

    /// Drops everything (full reinitialization).
    pub fn clear(&mut self) {
        self.by_entry.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::{Csn, ServerId};
    use crate::dn::Dn;
    use crate::update_msg::UpdatePayload;

    fn msg(uuid: u128, ts: i64) -> UpdateMsg {
        UpdateMsg {
            csn: Csn::new(ts, ServerId::new(1), 0),
            entry_uuid: EntryUuid::from_u128(uuid),
            dn: Dn::new("cn=x,dc=example"),
            payload: UpdatePayload::Delete,
        }
    }

    #[test]
    fn test_take_returns_csn_order() {
        let mut pending = PendingUpdates::new(10);
        pending.push(msg(1, 30)).unwrap();
        pending.push(msg(1, 10)).unwrap();
        pending.push(msg(2, 20)).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.entry_count(), 2);

        let taken = pending.take(&EntryUuid::from_u128(1));
        let ts: Vec<i64> = taken.iter().map(|m| m.csn.timestamp_ms()).collect();
        assert_eq!(ts, vec![10, 30]);
        assert_eq!(pending.len(), 1);
        assert!(pending.take(&EntryUuid::from_u128(1)).is_empty());
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut pending = PendingUpdates::new(10);
        pending.push(msg(1, 10)).unwrap();
        pending.push(msg(1, 10)).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_overflow() {
        let mut pending = PendingUpdates::new(2);
        pending.push(msg(1, 1)).unwrap();
        pending.push(msg(2, 2)).unwrap();
        let err = pending.push(msg(3, 3)).unwrap_err();
        assert!(matches!(err, ReplError::ConflictOverflow { capacity: 2 }));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.entry_count(), 2);
    }
}
