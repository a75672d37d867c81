//! Per-entry historical record: attribute name → CSN that last touched it.
//!
//! Rows live in a side-table of the entry store keyed by (entryUUID,
//! attribute). Two pseudo attributes carry entry-level history: [`DN_ATTR`]
//! holds the CSN that assigned the entry's current DN (its add or latest
//! rename) and [`DELETE_ATTR`] the newest delete CSN seen for the entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::csn::Csn;

/// Pseudo attribute holding the CSN that assigned the entry's DN.
pub const DN_ATTR: &str = "@dn";
/// Pseudo attribute holding the newest delete CSN.
pub const DELETE_ATTR: &str = "@delete";

/// Historical CSNs of one entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHistorical {
    csns: BTreeMap<String, Csn>,
}

impl EntryHistorical {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// CSN recorded for `attribute`.
    pub fn get(&self, attribute: &str) -> Option<Csn> {
        self.csns.get(attribute).copied()
    }

    /// Records `csn` for `attribute` if it is newer than the recorded one.
    ///
    /// Returns true if the record changed.
    pub fn record(&mut self, attribute: &str, csn: Csn) -> bool {
        match self.csns.get(attribute) {
            Some(known) if *known >= csn => false,
            _ => {
                self.csns.insert(attribute.to_string(), csn);
                true
            }
        }
    }

    /// CSN that assigned the current DN.
    pub fn dn_csn(&self) -> Option<Csn> {
        self.get(DN_ATTR)
    }

    /// Newest delete CSN.
    pub fn delete_csn(&self) -> Option<Csn> {
        self.get(DELETE_ATTR)
    }

    /// Newest CSN of any change that keeps the entry alive (everything but deletes).
    pub fn newest_change(&self) -> Option<Csn> {
        self.csns
            .iter()
            .filter(|(name, _)| name.as_str() != DELETE_ATTR)
            .map(|(_, csn)| *csn)
            .max()
    }

    /// An entry is live unless its newest delete is newer than every other change.
    pub fn is_live(&self) -> bool {
        match (self.delete_csn(), self.newest_change()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(deleted), Some(changed)) => changed > deleted,
        }
    }

    /// Iterates (attribute, CSN) rows.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Csn)> {
        self.csns.iter().map(|(name, csn)| (name.as_str(), *csn))
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Returns true if the record has no rows.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }
}

impl FromIterator<(String, Csn)> for EntryHistorical {
    fn from_iter<I: IntoIterator<Item = (String, Csn)>>(iter: I) -> Self {
        Self {
            csns: iter.into_iter().collect(),
        }
    }
}
