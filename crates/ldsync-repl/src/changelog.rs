//! Changelog store: durable, CSN-indexed queue of replicated changes.
//!
//! Records are partitioned by [`ReplicaId`] (base DN + originating server)
//! and keyed by CSN inside their partition, so a partition scan yields its
//! changes in CSN order. Records are immutable; they disappear only when
//! purged strictly below the acknowledgment watermark.
//!
//! Readers are cursors. A cursor never ends: once caught up it waits for the
//! next append, which wakes every waiting cursor.
//!
//! ```text
//! c/<base>\0 <server id> <csn>   → ChangelogRecord
//! cp/<base>\0 <server id>        → newest purged CSN
//! ca/<base>\0 <peer id>          → acknowledged ServerState of a peer
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::{BatchOp, KvBackend, KvPair};
use crate::csn::{wall_clock_ms, Csn, ServerId, CSN_KEY_LEN};
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::purge::{PurgeStats, PurgeTracker};
use crate::server_state::{ReplicaId, ServerState};
use crate::update_msg::UpdateMsg;

/// Records fetched per backend read by cursors.
const CURSOR_PAGE_SIZE: usize = 128;

/// Persisted form of one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    /// CSN of the update.
    pub csn: Csn,
    /// bincode-encoded [`UpdateMsg`].
    pub payload: Vec<u8>,
    /// CRC32 over the CSN key bytes and the payload.
    pub crc32: u32,
}

impl ChangelogRecord {
    /// Encodes `msg` into a record with its checksum.
    pub fn new(msg: &UpdateMsg) -> Result<Self> {
        let mut record = Self {
            csn: msg.csn,
            payload: bincode::serialize(msg)?,
            crc32: 0,
        };
        record.crc32 = record.compute_crc();
        Ok(record)
    }

    /// Compute the CRC32 for this record (excluding the crc32 field itself).
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.csn.to_key_bytes());
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Validate the CRC32 of this record.
    pub fn validate_crc(&self) -> bool {
        self.crc32 == self.compute_crc()
    }

    /// Decodes the update.
    pub fn decode(&self) -> Result<UpdateMsg> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

#[derive(Debug, Default, Clone)]
struct PartitionState {
    newest: Option<Csn>,
    last_purged: Option<Csn>,
    count: u64,
}

type PartitionKey = (String, ServerId);

struct ChangelogInner {
    backend: Arc<dyn KvBackend>,
    partitions: RwLock<BTreeMap<PartitionKey, PartitionState>>,
    purge: Mutex<PurgeTracker>,
    wakeup: watch::Sender<u64>,
}

/// Changelog of every base DN served by one process.
#[derive(Clone)]
pub struct ChangelogStore {
    inner: Arc<ChangelogInner>,
}

fn prefixed(tag: &[u8], base_key: &str) -> Vec<u8> {
    let mut key = tag.to_vec();
    key.extend_from_slice(base_key.as_bytes());
    key.push(0);
    key
}

fn domain_prefix(base_key: &str) -> Vec<u8> {
    prefixed(b"c/", base_key)
}

fn partition_prefix(key: &PartitionKey) -> Vec<u8> {
    let mut prefix = domain_prefix(&key.0);
    prefix.extend_from_slice(&key.1.as_u32().to_be_bytes());
    prefix
}

fn record_key(key: &PartitionKey, csn: &Csn) -> Vec<u8> {
    let mut out = partition_prefix(key);
    out.extend_from_slice(&csn.to_key_bytes());
    out
}

fn purge_mark_key(key: &PartitionKey) -> Vec<u8> {
    let mut out = prefixed(b"cp/", &key.0);
    out.extend_from_slice(&key.1.as_u32().to_be_bytes());
    out
}

fn ack_key(base_key: &str, peer: ServerId) -> Vec<u8> {
    let mut out = prefixed(b"ca/", base_key);
    out.extend_from_slice(&peer.as_u32().to_be_bytes());
    out
}

/// Splits `<tag><base>\0<server id>[rest]` into its parts.
fn parse_key<'a>(tag: &[u8], key: &'a [u8]) -> Option<(String, ServerId, &'a [u8])> {
    let rest = key.strip_prefix(tag)?;
    let nul = rest.iter().position(|b| *b == 0)?;
    let base = String::from_utf8(rest[..nul].to_vec()).ok()?;
    let tail = &rest[nul + 1..];
    if tail.len() < 4 {
        return None;
    }
    let mut sid = [0u8; 4];
    sid.copy_from_slice(&tail[..4]);
    Some((base, ServerId::new(u32::from_be_bytes(sid)), &tail[4..]))
}

fn to_changelog_error(e: ReplError) -> ReplError {
    match e {
        ReplError::Backend { msg } => ReplError::Changelog { msg },
        other => other,
    }
}

fn partition_key(replica: &ReplicaId) -> PartitionKey {
    (replica.base_dn.index_key(), replica.server_id)
}

impl ChangelogStore {
    /// Opens the changelog stored in `backend`, rebuilding partition and ack state.
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        let mut partitions: BTreeMap<PartitionKey, PartitionState> = BTreeMap::new();
        let mut purge = PurgeTracker::new();

        for pair in backend.export_all(b"c/") {
            let (key, _) = pair?;
            if let Some((base, sid, tail)) = parse_key(b"c/", &key) {
                if tail.len() != CSN_KEY_LEN {
                    continue;
                }
                let csn = Csn::from_key_bytes(tail)?;
                let state = partitions.entry((base, sid)).or_default();
                state.newest = Some(state.newest.map_or(csn, |n| n.max(csn)));
                state.count += 1;
            }
        }
        for (key, value) in backend.scan_prefix(b"cp/")? {
            if let Some((base, sid, _)) = parse_key(b"cp/", &key) {
                let csn: Csn = bincode::deserialize(&value)?;
                let state = partitions.entry((base, sid)).or_default();
                state.last_purged = Some(csn);
                if state.newest.is_none() {
                    state.newest = Some(csn);
                }
            }
        }
        for (key, value) in backend.scan_prefix(b"ca/")? {
            if let Some((base, peer, _)) = parse_key(b"ca/", &key) {
                let acked: ServerState = bincode::deserialize(&value)?;
                purge.record_ack(&base, peer, &acked, 0);
            }
        }

        let (wakeup, _) = watch::channel(0u64);
        Ok(Self {
            inner: Arc::new(ChangelogInner {
                backend,
                partitions: RwLock::new(partitions),
                purge: Mutex::new(purge),
                wakeup,
            }),
        })
    }

    fn notify(&self) {
        self.inner.wakeup.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Receiver bumped on every append or reset.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.wakeup.subscribe()
    }

    /// Appends `record` to the partition of `replica`.
    ///
    /// Returns `false` for a record that is not newer than the partition's
    /// newest one (a replayed duplicate).
    pub fn append(&self, replica: &ReplicaId, record: &ChangelogRecord) -> Result<bool> {
        if record.csn.server_id() != replica.server_id {
            return Err(ReplError::changelog(format!(
                "record {} does not belong to partition {}",
                record.csn, replica
            )));
        }
        let key = partition_key(replica);
        {
            let mut partitions = self.inner.partitions.write();
            let state = partitions.entry(key.clone()).or_default();
            if let Some(newest) = state.newest {
                if record.csn <= newest {
                    return Ok(false);
                }
            }
            self.inner
                .backend
                .put(record_key(&key, &record.csn), bincode::serialize(record)?)
                .map_err(to_changelog_error)?;
            state.newest = Some(record.csn);
            state.count += 1;
        }
        self.notify();
        Ok(true)
    }

    /// Newest CSN of a partition.
    pub fn newest(&self, replica: &ReplicaId) -> Option<Csn> {
        self.inner
            .partitions
            .read()
            .get(&partition_key(replica))
            .and_then(|s| s.newest)
    }

    /// Number of records retained in a partition.
    pub fn count(&self, replica: &ReplicaId) -> u64 {
        self.inner
            .partitions
            .read()
            .get(&partition_key(replica))
            .map(|s| s.count)
            .unwrap_or(0)
    }

    /// Server ids with a partition under `base`.
    pub fn partitions(&self, base: &Dn) -> Vec<ServerId> {
        let base_key = base.index_key();
        self.inner
            .partitions
            .read()
            .keys()
            .filter(|(b, _)| *b == base_key)
            .map(|(_, sid)| *sid)
            .collect()
    }

    /// Newest CSN of every partition under `base`.
    pub fn domain_state(&self, base: &Dn) -> ServerState {
        let base_key = base.index_key();
        let mut state = ServerState::new();
        for ((b, _), partition) in self.inner.partitions.read().iter() {
            if *b == base_key {
                if let Some(newest) = partition.newest {
                    state.update(&newest);
                }
            }
        }
        state
    }

    fn check_retained(&self, replica: &ReplicaId, after: Option<Csn>) -> Result<()> {
        let last_purged = self
            .inner
            .partitions
            .read()
            .get(&partition_key(replica))
            .and_then(|s| s.last_purged);
        match (last_purged, after) {
            (Some(purged), None) => Err(ReplError::ChangesPurged {
                replica: replica.clone(),
                purged_up_to: purged,
            }),
            (Some(purged), Some(after)) if after < purged => Err(ReplError::ChangesPurged {
                replica: replica.clone(),
                purged_up_to: purged,
            }),
            _ => Ok(()),
        }
    }

    fn read_page(&self, replica: &ReplicaId, after: Option<Csn>) -> Result<Vec<ChangelogRecord>> {
        let key = partition_key(replica);
        let prefix = partition_prefix(&key);
        let after_key = after.map(|csn| record_key(&key, &csn));
        let page = self
            .inner
            .backend
            .scan_page(&prefix, after_key.as_deref(), CURSOR_PAGE_SIZE)
            .map_err(to_changelog_error)?;
        page.into_iter()
            .map(|(_, value)| {
                let record: ChangelogRecord = bincode::deserialize(&value)?;
                if !record.validate_crc() {
                    return Err(ReplError::changelog(format!(
                        "corrupt record {} in {}",
                        record.csn, replica
                    )));
                }
                Ok(record)
            })
            .collect()
    }

    /// Opens a cursor on the partition of `replica` yielding records newer than `after`.
    ///
    /// Fails with [`ReplError::ChangesPurged`] if records newer than `after`
    /// were already purged.
    pub fn read_from(&self, replica: &ReplicaId, after: Option<Csn>) -> Result<ChangelogCursor> {
        self.check_retained(replica, after)?;
        Ok(ChangelogCursor {
            store: self.clone(),
            replica: replica.clone(),
            position: after,
            buffer: VecDeque::new(),
            wakeup: self.subscribe(),
        })
    }

    /// Opens a cursor over every partition of `base` except `exclude`,
    /// starting after the positions of `start`.
    pub fn read_domain(
        &self,
        base: &Dn,
        start: &ServerState,
        exclude: Option<ServerId>,
    ) -> DomainCursor {
        DomainCursor {
            store: self.clone(),
            base: base.clone(),
            exclude,
            position: start.clone(),
            cursors: BTreeMap::new(),
            heads: BTreeMap::new(),
            wakeup: self.subscribe(),
        }
    }

    /// Records in `base` newer than `state`, skipping `exclude`'s partition.
    pub fn count_missing(
        &self,
        base: &Dn,
        state: &ServerState,
        exclude: Option<ServerId>,
    ) -> Result<u64> {
        let mut missing = 0u64;
        for sid in self.partitions(base) {
            if Some(sid) == exclude {
                continue;
            }
            let key = (base.index_key(), sid);
            let prefix = partition_prefix(&key);
            let mut after = state.max_csn(sid).map(|csn| record_key(&key, &csn));
            loop {
                let page = self
                    .inner
                    .backend
                    .scan_page(&prefix, after.as_deref(), CURSOR_PAGE_SIZE)
                    .map_err(to_changelog_error)?;
                missing += page.len() as u64;
                if page.len() < CURSOR_PAGE_SIZE {
                    break;
                }
                after = page.last().map(|(k, _)| k.clone());
            }
        }
        Ok(missing)
    }

    /// Fails with [`ReplError::ChangesPurged`] if a reader starting at
    /// `state` would miss purged records of some partition of `base`.
    pub fn check_available(
        &self,
        base: &Dn,
        state: &ServerState,
        exclude: Option<ServerId>,
    ) -> Result<()> {
        for sid in self.partitions(base) {
            if Some(sid) == exclude {
                continue;
            }
            self.check_retained(&ReplicaId::new(base.clone(), sid), state.max_csn(sid))?;
        }
        Ok(())
    }

    /// Declares `peer` as a consumer of `base`.
    pub fn register_peer(&self, base: &Dn, peer: ServerId) -> Result<()> {
        let base_key = base.index_key();
        let mut purge = self.inner.purge.lock();
        if purge.get_ack(&base_key, peer).is_none() {
            purge.register_peer(&base_key, peer);
            self.inner
                .backend
                .put(ack_key(&base_key, peer), bincode::serialize(&ServerState::new())?)
                .map_err(to_changelog_error)?;
        }
        Ok(())
    }

    /// Stops waiting for acknowledgments of `peer`.
    pub fn forget_peer(&self, base: &Dn, peer: ServerId) -> Result<()> {
        let base_key = base.index_key();
        self.inner.purge.lock().forget_peer(&base_key, peer);
        self.inner
            .backend
            .delete(&ack_key(&base_key, peer))
            .map_err(to_changelog_error)
    }

    /// Records that `peer` has durably received everything in `state`.
    pub fn record_ack(&self, base: &Dn, peer: ServerId, state: &ServerState) -> Result<()> {
        let base_key = base.index_key();
        let merged = self
            .inner
            .purge
            .lock()
            .record_ack(&base_key, peer, state, wall_clock_ms());
        self.inner
            .backend
            .put(ack_key(&base_key, peer), bincode::serialize(&merged)?)
            .map_err(to_changelog_error)
    }

    /// Acknowledged state of `peer`.
    pub fn acked_state(&self, base: &Dn, peer: ServerId) -> Option<ServerState> {
        self.inner
            .purge
            .lock()
            .get_ack(&base.index_key(), peer)
            .map(|a| a.state.clone())
    }

    /// Purge watermark of a partition.
    pub fn watermark(&self, replica: &ReplicaId) -> Option<Csn> {
        self.inner
            .purge
            .lock()
            .watermark(&replica.base_dn.index_key(), replica.server_id)
    }

    /// Removes records of `replica` strictly below `csn`.
    ///
    /// Rejected, with nothing removed, when `csn` is above the partition's
    /// watermark or no watermark exists.
    pub fn purge_before(&self, replica: &ReplicaId, csn: Csn) -> Result<usize> {
        match self.watermark(replica) {
            None => {
                return Err(ReplError::changelog(format!(
                    "no purge watermark for {}",
                    replica
                )))
            }
            Some(watermark) if csn > watermark => {
                return Err(ReplError::changelog(format!(
                    "purge point {} is above the watermark {} of {}",
                    csn, watermark, replica
                )))
            }
            Some(_) => {}
        }

        let key = partition_key(replica);
        let prefix = partition_prefix(&key);
        let mut doomed: Vec<KvPair> = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        'scan: loop {
            let page = self
                .inner
                .backend
                .scan_page(&prefix, after.as_deref(), CURSOR_PAGE_SIZE)
                .map_err(to_changelog_error)?;
            let full = page.len() == CURSOR_PAGE_SIZE;
            for (k, v) in page {
                if Csn::from_key_bytes(&k[prefix.len()..])? >= csn {
                    break 'scan;
                }
                after = Some(k.clone());
                doomed.push((k, v));
            }
            if !full {
                break;
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let last = match doomed.last() {
            Some((k, _)) => Csn::from_key_bytes(&k[prefix.len()..])?,
            None => return Ok(0),
        };
        let removed = doomed.len();
        let mut ops: Vec<BatchOp> = doomed
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        ops.push(BatchOp::Put {
            key: purge_mark_key(&key),
            value: bincode::serialize(&last)?,
        });
        {
            let mut partitions = self.inner.partitions.write();
            self.inner
                .backend
                .write_batch(ops)
                .map_err(to_changelog_error)?;
            let state = partitions.entry(key).or_default();
            state.count = state.count.saturating_sub(removed as u64);
            state.last_purged = Some(state.last_purged.map_or(last, |p| p.max(last)));
        }
        self.inner.purge.lock().record_run(removed, wall_clock_ms());
        debug!(replica = %replica, purged = removed, up_to = %last, "changelog purged");
        Ok(removed)
    }

    /// Purges every partition of `base` below its watermark, keeping records
    /// younger than `purge_delay_ms`.
    pub fn purge_to_watermark(&self, base: &Dn, purge_delay_ms: u64) -> Result<usize> {
        let delay = i64::try_from(purge_delay_ms).unwrap_or(i64::MAX);
        self.purge_to_watermark_at(base, wall_clock_ms().saturating_sub(delay))
    }

    /// Like [`ChangelogStore::purge_to_watermark`] with an explicit retention horizon.
    pub fn purge_to_watermark_at(&self, base: &Dn, horizon_ms: i64) -> Result<usize> {
        let horizon = Csn::new(horizon_ms, ServerId::new(0), 0);
        let mut total = 0;
        for sid in self.partitions(base) {
            let replica = ReplicaId::new(base.clone(), sid);
            if let Some(watermark) = self.watermark(&replica) {
                total += self.purge_before(&replica, watermark.min(horizon))?;
            }
        }
        Ok(total)
    }

    /// Drops every partition and acknowledgment of `base`.
    pub fn clear_domain(&self, base: &Dn) -> Result<()> {
        let base_key = base.index_key();
        {
            let mut partitions = self.inner.partitions.write();
            for prefix in [
                domain_prefix(&base_key),
                prefixed(b"cp/", &base_key),
                prefixed(b"ca/", &base_key),
            ] {
                self.inner
                    .backend
                    .import_all(&prefix, Vec::new())
                    .map_err(to_changelog_error)?;
            }
            partitions.retain(|(b, _), _| *b != base_key);
            self.inner.purge.lock().clear(&base_key);
        }
        info!(base_dn = %base, "changelog cleared");
        self.notify();
        Ok(())
    }

    /// Purge statistics.
    pub fn purge_stats(&self) -> PurgeStats {
        self.inner.purge.lock().stats().clone()
    }
}

/// Endless reader of one partition.
pub struct ChangelogCursor {
    store: ChangelogStore,
    replica: ReplicaId,
    position: Option<Csn>,
    buffer: VecDeque<ChangelogRecord>,
    wakeup: watch::Receiver<u64>,
}

impl ChangelogCursor {
    /// Partition read by this cursor.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// CSN of the last record returned.
    pub fn position(&self) -> Option<Csn> {
        self.position
    }

    /// Next record if one is available, without waiting.
    pub fn try_next(&mut self) -> Result<Option<ChangelogRecord>> {
        if self.buffer.is_empty() {
            self.store.check_retained(&self.replica, self.position)?;
            self.buffer = self.store.read_page(&self.replica, self.position)?.into();
        }
        Ok(self.buffer.pop_front().map(|record| {
            self.position = Some(record.csn);
            record
        }))
    }

    /// Next record, waiting for an append when caught up.
    pub async fn next(&mut self) -> Result<ChangelogRecord> {
        loop {
            let _ = self.wakeup.borrow_and_update();
            if let Some(record) = self.try_next()? {
                return Ok(record);
            }
            self.wakeup
                .changed()
                .await
                .map_err(|_| ReplError::Shutdown)?;
        }
    }
}

/// Endless reader merging every partition of one base DN in CSN order.
///
/// New partitions are picked up as they appear.
pub struct DomainCursor {
    store: ChangelogStore,
    base: Dn,
    exclude: Option<ServerId>,
    position: ServerState,
    cursors: BTreeMap<ServerId, ChangelogCursor>,
    heads: BTreeMap<ServerId, ChangelogRecord>,
    wakeup: watch::Receiver<u64>,
}

impl DomainCursor {
    /// Everything returned so far, merged with the start state.
    pub fn position(&self) -> &ServerState {
        &self.position
    }

    fn discover(&mut self) -> Result<()> {
        for sid in self.store.partitions(&self.base) {
            if Some(sid) == self.exclude || self.cursors.contains_key(&sid) {
                continue;
            }
            let replica = ReplicaId::new(self.base.clone(), sid);
            let cursor = self
                .store
                .read_from(&replica, self.position.max_csn(sid))?;
            self.cursors.insert(sid, cursor);
        }
        Ok(())
    }

    /// Next record if one is available, without waiting.
    pub fn try_next(&mut self) -> Result<Option<ChangelogRecord>> {
        self.discover()?;
        for (sid, cursor) in self.cursors.iter_mut() {
            if self.heads.contains_key(sid) {
                continue;
            }
            if let Some(record) = cursor.try_next()? {
                self.heads.insert(*sid, record);
            }
        }
        let oldest = self
            .heads
            .iter()
            .min_by_key(|(_, record)| record.csn)
            .map(|(sid, _)| *sid);
        Ok(oldest.and_then(|sid| self.heads.remove(&sid)).map(|record| {
            self.position.update(&record.csn);
            record
        }))
    }

    /// Next record, waiting for an append when caught up.
    pub async fn next(&mut self) -> Result<ChangelogRecord> {
        loop {
            let _ = self.wakeup.borrow_and_update();
            if let Some(record) = self.try_next()? {
                return Ok(record);
            }
            self.wakeup
                .changed()
                .await
                .map_err(|_| ReplError::Shutdown)?;
        }
    }
}
