//! Generation ID: fingerprint of the data set a replica started from.
//!
//! Two replicas can only exchange incremental changes if they descend from
//! the same initial data. The fingerprint is computed once, when a domain
//! first starts on a backend, and persisted; it changes only through a full
//! reinitialization.

use sha2::{Digest, Sha256};

use crate::entry_store::EntryStore;
use crate::error::Result;

const GENERATION_META: &str = "generation";

/// Fingerprint of key-ordered entry records: first eight bytes of their SHA-256.
pub fn fingerprint<'a, I>(records: I) -> u64
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut hasher = Sha256::new();
    for (key, value) in records {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Computes the generation ID of the entries currently in `store`.
pub fn compute(store: &EntryStore) -> Result<u64> {
    let records = store.export_entries()?;
    Ok(fingerprint(
        records.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
    ))
}

/// Persisted generation ID, computing and persisting it on first use.
pub fn load_or_init(store: &EntryStore) -> Result<u64> {
    if let Some(id) = store.load_meta::<u64>(GENERATION_META)? {
        return Ok(id);
    }
    let id = compute(store)?;
    store.store_meta(GENERATION_META, &id)?;
    tracing::info!(base_dn = %store.base_dn(), generation_id = id, "generation ID initialized");
    Ok(id)
}

/// Overwrites the persisted generation ID (after a full update).
pub fn persist(store: &EntryStore, id: u64) -> Result<()> {
    store.store_meta(GENERATION_META, &id)
}
