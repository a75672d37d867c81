//! Replicated change messages.
//!
//! An [`UpdateMsg`] is immutable once stamped. It identifies its target by
//! entryUUID; the DN it carries is informational (the DN at the time of the
//! operation) and is only used to reconstruct adds and to route logs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::csn::Csn;
use crate::dn::Dn;

/// Attribute name → values.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Stable identity of a directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryUuid(Uuid);

impl EntryUuid {
    /// Generates a random entryUUID.
    pub fn new_v4() -> Self {
        EntryUuid(Uuid::new_v4())
    }

    /// Builds an entryUUID from a raw 128-bit value (tests and imports).
    pub fn from_u128(v: u128) -> Self {
        EntryUuid(Uuid::from_u128(v))
    }

    /// Raw bytes, used as a storage key component.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Decodes raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(EntryUuid)
    }
}

impl fmt::Display for EntryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Kind of directory operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Entry creation.
    Add,
    /// Attribute modification.
    Modify,
    /// Entry removal.
    Delete,
    /// DN change.
    Rename,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Add => "add",
            OperationKind::Modify => "modify",
            OperationKind::Delete => "delete",
            OperationKind::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// Resulting value set of one attribute after a modify.
///
/// An empty `values` removes the attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrChange {
    /// Lowercased attribute name.
    pub attribute: String,
    /// Full value set after the change.
    pub values: Vec<String>,
}

/// Operation-specific content of an update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Full initial attribute set.
    Add {
        /// Attributes of the new entry.
        attributes: Attributes,
    },
    /// Per-attribute replacement value sets.
    Modify {
        /// Touched attributes.
        changes: Vec<AttrChange>,
        /// Attribute → CSN that last touched it, as recorded by the originator.
        historical: BTreeMap<String, Csn>,
    },
    /// Entry removal.
    Delete,
    /// DN change.
    Rename {
        /// New DN of the entry.
        new_dn: Dn,
    },
}

/// One replicated change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Change sequence number assigned by the originating replica.
    pub csn: Csn,
    /// Target entry.
    pub entry_uuid: EntryUuid,
    /// DN of the target when the change was made.
    pub dn: Dn,
    /// Operation content.
    pub payload: UpdatePayload,
}

impl UpdateMsg {
    /// Kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self.payload {
            UpdatePayload::Add { .. } => OperationKind::Add,
            UpdatePayload::Modify { .. } => OperationKind::Modify,
            UpdatePayload::Delete => OperationKind::Delete,
            UpdatePayload::Rename { .. } => OperationKind::Rename,
        }
    }

    /// CSN governing `attribute` in this message.
    pub fn attribute_csn(&self, attribute: &str) -> Csn {
        match &self.payload {
            UpdatePayload::Modify { historical, .. } => {
                historical.get(attribute).copied().unwrap_or(self.csn)
            }
            _ => self.csn,
        }
    }
}

/// One value-level modification of a local modify request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Adds values to the attribute.
    Add {
        /// Attribute name.
        attribute: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Removes values (all values when empty).
    Delete {
        /// Attribute name.
        attribute: String,
        /// Values to remove.
        values: Vec<String>,
    },
    /// Replaces every value.
    Replace {
        /// Attribute name.
        attribute: String,
        /// New values.
        values: Vec<String>,
    },
}

impl Modification {
    fn attribute(&self) -> String {
        match self {
            Modification::Add { attribute, .. }
            | Modification::Delete { attribute, .. }
            | Modification::Replace { attribute, .. } => attribute.to_lowercase(),
        }
    }
}

/// A change requested by a local client, addressed by DN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalChange {
    /// Create an entry.
    Add {
        /// DN of the new entry.
        dn: Dn,
        /// Initial attributes.
        attributes: Attributes,
    },
    /// Modify attributes.
    Modify {
        /// Target DN.
        dn: Dn,
        /// Value-level modifications.
        modifications: Vec<Modification>,
    },
    /// Delete an entry.
    Delete {
        /// Target DN.
        dn: Dn,
    },
    /// Rename an entry.
    Rename {
        /// Target DN.
        dn: Dn,
        /// New DN.
        new_dn: Dn,
    },
}

impl LocalChange {
    /// DN the change is addressed to.
    pub fn dn(&self) -> &Dn {
        match self {
            LocalChange::Add { dn, .. }
            | LocalChange::Modify { dn, .. }
            | LocalChange::Delete { dn }
            | LocalChange::Rename { dn, .. } => dn,
        }
    }
}

/// Lowercases attribute names and sorts/deduplicates values.
pub fn normalize_attributes(attributes: &Attributes) -> Attributes {
    let mut out = Attributes::new();
    for (name, values) in attributes {
        let slot: &mut Vec<String> = out.entry(name.to_lowercase()).or_default();
        slot.extend(values.iter().cloned());
    }
    for values in out.values_mut() {
        values.sort();
        values.dedup();
    }
    out.retain(|_, values| !values.is_empty());
    out
}

/// Converts value-level modifications into full replacement value sets
/// against the entry's `current` attributes.
pub fn to_attr_changes(current: &Attributes, modifications: &[Modification]) -> Vec<AttrChange> {
    let mut touched: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for modification in modifications {
        let attribute = modification.attribute();
        let values = touched
            .entry(attribute.clone())
            .or_insert_with(|| current.get(&attribute).cloned().unwrap_or_default());
        match modification {
            Modification::Add { values: added, .. } => values.extend(added.iter().cloned()),
            Modification::Delete {
                values: removed, ..
            } => {
                if removed.is_empty() {
                    values.clear();
                } else {
                    values.retain(|v| !removed.contains(v));
                }
            }
            Modification::Replace {
                values: replacement,
                ..
            } => *values = replacement.clone(),
        }
        values.sort();
        values.dedup();
    }
    touched
        .into_iter()
        .map(|(attribute, values)| AttrChange { attribute, values })
        .collect()
}
