//! Replicated entry storage for one base DN on top of a [`KvBackend`].
//!
//! Layout (all keys of a base DN share one data prefix so a full update can
//! replace them atomically):
//!
//! ```text
//! r/<base>\0 e <uuid>               → StoredEntry
//! r/<base>\0 h <uuid> <attribute>   → Csn          (historical side-table)
//! r/<base>\0 n <dn key>\0 <uuid>    → Claim        (naming index)
//! r/<base>\0 l <uuid>               → Placement
//! r/<base>\0 p <dn key>             → uuid         (placed DN lookup)
//! m/<base>\0 <name>                 → metadata (generation ID, ServerState)
//! ```
//!
//! A *claim* records that a live entry wants a DN and the CSN that assigned
//! it. The placement of every claimant of a DN is a pure function of the
//! claim set: the lowest (CSN, entryUUID) owns the DN, every other claimant
//! lives under the conflict container.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{BatchOp, KvBackend, KvPair};
use crate::csn::Csn;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::historical::EntryHistorical;
use crate::update_msg::{Attributes, EntryUuid};

const TAG_ENTRY: u8 = b'e';
const TAG_HISTORICAL: u8 = b'h';
const TAG_CLAIM: u8 = b'n';
const TAG_PLACEMENT: u8 = b'l';
const TAG_PLACED: u8 = b'p';

/// Persisted content of an entry, live or tombstoned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Entry identity.
    pub uuid: EntryUuid,
    /// DN the entry was added or renamed to.
    pub expected_dn: Dn,
    /// Attribute values.
    pub attributes: Attributes,
    /// Deleted but retained with its history.
    pub tombstone: bool,
}

/// Where a live entry currently sits in the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Actual DN.
    pub dn: Dn,
    /// True when displaced into the conflict container.
    pub conflict: bool,
}

/// A live entry's claim on a DN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// CSN that assigned the DN.
    pub csn: Csn,
    /// Claimed DN, as written by the client.
    pub dn: Dn,
}

/// Naming-index mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOp {
    /// Adds or replaces the claim of `uuid`.
    Put {
        /// Claimant.
        uuid: EntryUuid,
        /// Claim content.
        claim: Claim,
    },
    /// Withdraws the claim of `uuid` on `dn`.
    Remove {
        /// Claimant.
        uuid: EntryUuid,
        /// Previously claimed DN.
        dn: Dn,
    },
}

/// One atomic write of an entry, its history rows and naming claims.
#[derive(Clone, Debug)]
pub struct EntryWrite {
    /// Stored content the write was computed from; `None` for a new entry.
    pub previous: Option<StoredEntry>,
    /// New entry content.
    pub entry: StoredEntry,
    /// Historical rows to upsert.
    pub historical: Vec<(String, Csn)>,
    /// Naming index changes.
    pub claims: Vec<ClaimOp>,
    /// Remove the entry from the tree (tombstoning).
    pub unplace: bool,
}

/// A placement moved by [`EntryStore::settle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementChange {
    /// Entry moved.
    pub uuid: EntryUuid,
    /// Placement before settlement.
    pub previous: Option<Placement>,
    /// Placement after settlement.
    pub current: Placement,
}

/// Client-facing view of a live entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Entry identity.
    pub uuid: EntryUuid,
    /// Actual DN.
    pub dn: Dn,
    /// Attribute values.
    pub attributes: Attributes,
    /// DN the entry expected, when it was displaced by a naming conflict.
    pub conflict_of: Option<Dn>,
}

/// Entry storage for one base DN.
#[derive(Clone)]
pub struct EntryStore {
    backend: Arc<dyn KvBackend>,
    base: Dn,
    data_prefix: Vec<u8>,
    meta_prefix: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

impl EntryStore {
    /// Opens the store of `base` on `backend`.
    pub fn new(backend: Arc<dyn KvBackend>, base: Dn) -> Self {
        let mut data_prefix = b"r/".to_vec();
        data_prefix.extend_from_slice(base.index_key().as_bytes());
        data_prefix.push(0);
        let mut meta_prefix = b"m/".to_vec();
        meta_prefix.extend_from_slice(base.index_key().as_bytes());
        meta_prefix.push(0);
        Self {
            backend,
            base,
            data_prefix,
            meta_prefix,
        }
    }

    /// Base DN served by this store.
    pub fn base_dn(&self) -> &Dn {
        &self.base
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn key(&self, tag: u8, parts: &[&[u8]]) -> Vec<u8> {
        let mut key = self.data_prefix.clone();
        key.push(tag);
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    fn entry_key(&self, uuid: &EntryUuid) -> Vec<u8> {
        self.key(TAG_ENTRY, &[uuid.as_bytes()])
    }

    fn historical_key(&self, uuid: &EntryUuid, attribute: &str) -> Vec<u8> {
        self.key(TAG_HISTORICAL, &[uuid.as_bytes(), attribute.as_bytes()])
    }

    fn claim_prefix(&self, dn: &Dn) -> Vec<u8> {
        self.key(TAG_CLAIM, &[dn.index_key().as_bytes(), &[0]])
    }

    fn claim_key(&self, dn: &Dn, uuid: &EntryUuid) -> Vec<u8> {
        let mut key = self.claim_prefix(dn);
        key.extend_from_slice(uuid.as_bytes());
        key
    }

    fn placement_key(&self, uuid: &EntryUuid) -> Vec<u8> {
        self.key(TAG_PLACEMENT, &[uuid.as_bytes()])
    }

    fn placed_key(&self, dn: &Dn) -> Vec<u8> {
        self.key(TAG_PLACED, &[dn.index_key().as_bytes()])
    }

    fn meta_key(&self, name: &str) -> Vec<u8> {
        let mut key = self.meta_prefix.clone();
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Stored entry (live or tombstone).
    pub fn get(&self, uuid: &EntryUuid) -> Result<Option<StoredEntry>> {
        self.backend
            .get(&self.entry_key(uuid))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Historical record of an entry (empty if unknown).
    pub fn historical(&self, uuid: &EntryUuid) -> Result<EntryHistorical> {
        let prefix = self.key(TAG_HISTORICAL, &[uuid.as_bytes()]);
        self.backend
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, value)| {
                let attribute = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                Ok((attribute, decode::<Csn>(&value)?))
            })
            .collect()
    }

    /// Current placement of a live entry.
    pub fn placement(&self, uuid: &EntryUuid) -> Result<Option<Placement>> {
        self.backend
            .get(&self.placement_key(uuid))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// entryUUID of the live entry placed at `dn`.
    pub fn lookup_dn(&self, dn: &Dn) -> Result<Option<EntryUuid>> {
        match self.backend.get(&self.placed_key(dn))? {
            Some(bytes) => EntryUuid::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| ReplError::backend(format!("corrupt DN index for {}", dn))),
            None => Ok(None),
        }
    }

    /// Live entry placed at `dn`.
    pub fn find(&self, dn: &Dn) -> Result<Option<DirectoryEntry>> {
        match self.lookup_dn(dn)? {
            Some(uuid) => self.find_uuid(&uuid),
            None => Ok(None),
        }
    }

    /// Live entry with identity `uuid`.
    pub fn find_uuid(&self, uuid: &EntryUuid) -> Result<Option<DirectoryEntry>> {
        let entry = match self.get(uuid)? {
            Some(entry) if !entry.tombstone => entry,
            _ => return Ok(None),
        };
        let placement = match self.placement(uuid)? {
            Some(placement) => placement,
            None => return Ok(None),
        };
        Ok(Some(DirectoryEntry {
            uuid: entry.uuid,
            conflict_of: placement.conflict.then(|| entry.expected_dn.clone()),
            dn: placement.dn,
            attributes: entry.attributes,
        }))
    }

    /// Every claim on `dn`.
    pub fn claims(&self, dn: &Dn) -> Result<Vec<(EntryUuid, Claim)>> {
        let prefix = self.claim_prefix(dn);
        let mut claims = Vec::new();
        for (key, value) in self.backend.scan_prefix(&prefix)? {
            let uuid = EntryUuid::from_slice(&key[prefix.len()..])
                .ok_or_else(|| ReplError::backend(format!("corrupt naming index for {}", dn)))?;
            claims.push((uuid, decode::<Claim>(&value)?));
        }
        Ok(claims)
    }

    /// Writes an entry with its history rows and naming changes in one batch.
    ///
    /// The batch is only applied while the stored entry still equals
    /// `write.previous`; otherwise the write fails with a transient backend
    /// error and nothing is written.
    pub fn commit(&self, write: &EntryWrite) -> Result<()> {
        let uuid = write.entry.uuid;
        let entry_key = self.entry_key(&uuid);
        let mut ops = Vec::with_capacity(3 + write.historical.len() + write.claims.len());
        if write.unplace {
            if let Some(placement) = self.placement(&uuid)? {
                if self.lookup_dn(&placement.dn)? == Some(uuid) {
                    ops.push(BatchOp::Delete {
                        key: self.placed_key(&placement.dn),
                    });
                }
                ops.push(BatchOp::Delete {
                    key: self.placement_key(&uuid),
                });
            }
        }
        ops.push(BatchOp::Put {
            key: entry_key.clone(),
            value: encode(&write.entry)?,
        });
        for (attribute, csn) in &write.historical {
            ops.push(BatchOp::Put {
                key: self.historical_key(&uuid, attribute),
                value: encode(csn)?,
            });
        }
        for op in &write.claims {
            match op {
                ClaimOp::Put { uuid, claim } => ops.push(BatchOp::Put {
                    key: self.claim_key(&claim.dn, uuid),
                    value: encode(claim)?,
                }),
                ClaimOp::Remove { uuid, dn } => ops.push(BatchOp::Delete {
                    key: self.claim_key(dn, uuid),
                }),
            }
        }

        let mut ops = Some(ops);
        self.backend.read_modify_write(&entry_key, &mut |current: Option<&[u8]>| {
            let current = current.map(decode::<StoredEntry>).transpose()?;
            if current != write.previous {
                return Err(ReplError::backend(format!(
                    "entry {uuid} changed since it was read"
                )));
            }
            ops.take()
                .ok_or_else(|| ReplError::backend("entry batch already applied"))
        })
    }

    /// Recomputes the placement of every claimant of `dn`.
    ///
    /// Returns the placements that changed. Callers serialize settlement.
    pub fn settle(&self, dn: &Dn) -> Result<Vec<PlacementChange>> {
        let mut claims = self.claims(dn)?;
        claims.sort_by(|a, b| (a.1.csn, a.0).cmp(&(b.1.csn, b.0)));

        let mut deletes = Vec::new();
        let mut puts = Vec::new();
        let mut changed = Vec::new();
        for (idx, (uuid, claim)) in claims.iter().enumerate() {
            let desired = if idx == 0 {
                Placement {
                    dn: claim.dn.clone(),
                    conflict: false,
                }
            } else {
                Placement {
                    dn: Dn::conflict_dn(&self.base, &uuid.to_string(), &claim.dn),
                    conflict: true,
                }
            };
            let current = self.placement(uuid)?;
            if current.as_ref() == Some(&desired) {
                continue;
            }
            if let Some(current) = &current {
                if self.lookup_dn(&current.dn)? == Some(*uuid) {
                    deletes.push(BatchOp::Delete {
                        key: self.placed_key(&current.dn),
                    });
                }
            }
            puts.push(BatchOp::Put {
                key: self.placement_key(uuid),
                value: encode(&desired)?,
            });
            puts.push(BatchOp::Put {
                key: self.placed_key(&desired.dn),
                value: uuid.as_bytes().to_vec(),
            });
            changed.push(PlacementChange {
                uuid: *uuid,
                previous: current,
                current: desired,
            });
        }
        if !changed.is_empty() {
            deletes.extend(puts);
            self.backend.write_batch(deletes)?;
        }
        Ok(changed)
    }

    /// Every live entry, in entryUUID order.
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        let prefix = self.key(TAG_ENTRY, &[]);
        let mut out = Vec::new();
        for (key, _) in self.backend.scan_prefix(&prefix)? {
            if let Some(uuid) = EntryUuid::from_slice(&key[prefix.len()..]) {
                if let Some(entry) = self.find_uuid(&uuid)? {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Number of live entries displaced into the conflict container.
    pub fn conflict_count(&self) -> Result<usize> {
        let prefix = self.key(TAG_PLACEMENT, &[]);
        let mut count = 0;
        for (_, value) in self.backend.scan_prefix(&prefix)? {
            if decode::<Placement>(&value)?.conflict {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every stored key of this base DN (entries, history, naming index).
    pub fn export(&self) -> Result<Vec<KvPair>> {
        self.backend.export_all(&self.data_prefix).collect()
    }

    /// Entry records only, in key order (generation fingerprint input).
    pub fn export_entries(&self) -> Result<Vec<KvPair>> {
        self.backend
            .export_all(&self.key(TAG_ENTRY, &[]))
            .collect()
    }

    /// Replaces every stored key of this base DN with `pairs`.
    ///
    /// `pairs` must come from [`EntryStore::export`] of a store with the same base DN.
    pub fn import(&self, pairs: Vec<KvPair>) -> Result<()> {
        self.backend.import_all(&self.data_prefix, pairs)
    }

    /// Reads a metadata value.
    pub fn load_meta<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.backend
            .get(&self.meta_key(name))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Writes a metadata value.
    pub fn store_meta<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.backend.put(self.meta_key(name), encode(value)?)
    }
}
