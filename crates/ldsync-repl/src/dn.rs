//! Distinguished names.
//!
//! Only the structural parts of a DN matter to replication: splitting off the
//! RDN, walking to the parent, and testing whether an entry lives below a
//! replicated base DN. Values are compared case-sensitively; attribute types
//! are lowercased and whitespace around separators is removed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// RDN of the container holding entries displaced by naming conflicts.
pub const CONFLICT_CONTAINER_RDN: &str = "cn=replication conflicts";

/// A normalized distinguished name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dn(String);

impl Dn {
    /// Parses and normalizes a DN string.
    pub fn new(raw: &str) -> Self {
        let rdns: Vec<String> = split_unescaped(raw, ',')
            .into_iter()
            .map(|rdn| normalize_rdn(&rdn))
            .filter(|rdn| !rdn.is_empty())
            .collect();
        Dn(rdns.join(","))
    }

    /// The root (empty) DN.
    pub fn root() -> Self {
        Dn(String::new())
    }

    /// Returns the normalized string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the root DN.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Leftmost RDN, e.g. `cn=alice` for `cn=alice,ou=people,dc=example`.
    pub fn rdn(&self) -> &str {
        match find_unescaped(&self.0, ',') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Parent DN, or `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        match find_unescaped(&self.0, ',') {
            Some(idx) => Some(Dn(self.0[idx + 1..].to_string())),
            None => Some(Dn::root()),
        }
    }

    /// Builds `rdn,self`.
    pub fn child(&self, rdn: &str) -> Dn {
        let rdn = normalize_rdn(rdn);
        if self.is_root() {
            Dn(rdn)
        } else {
            Dn(format!("{},{}", rdn, self.0))
        }
    }

    /// Returns true if `self` equals `base` or lies below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        if base.is_root() || self == base {
            return true;
        }
        self.0.len() > base.0.len()
            && self.0.ends_with(&base.0)
            && self.0.as_bytes()[self.0.len() - base.0.len() - 1] == b','
    }

    /// Container under `base` that receives conflicting entries.
    pub fn conflict_container(base: &Dn) -> Dn {
        base.child(CONFLICT_CONTAINER_RDN)
    }

    /// DN given to an entry displaced from `expected` by a naming conflict.
    ///
    /// The entryUUID is folded into a multi-valued RDN so the DN is unique and
    /// identical on every replica.
    pub fn conflict_dn(base: &Dn, entry_uuid: &str, expected: &Dn) -> Dn {
        let rdn = format!("entryuuid={}+{}", entry_uuid, expected.rdn());
        Dn::conflict_container(base).child(&rdn)
    }

    /// Lowercased key used by the naming index.
    pub fn index_key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(raw: &str) -> Self {
        Dn::new(raw)
    }
}

fn normalize_rdn(rdn: &str) -> String {
    split_unescaped(rdn, '+')
        .into_iter()
        .map(|ava| {
            let ava = ava.trim();
            match find_unescaped(ava, '=') {
                Some(idx) => format!(
                    "{}={}",
                    ava[..idx].trim().to_lowercase(),
                    ava[idx + 1..].trim()
                ),
                None => ava.to_string(),
            }
        })
        .filter(|ava| !ava.is_empty())
        .collect::<Vec<_>>()
        .join("+")
}

fn find_unescaped(s: &str, sep: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            return Some(idx);
        }
    }
    None
}

fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            current.push(ch);
            escaped = true;
        } else if ch == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_spacing_and_type_case() {
        let dn = Dn::new(" CN = Alice , OU=People,  dc=example ");
        assert_eq!(dn.as_str(), "cn=Alice,ou=People,dc=example");
    }

    #[test]
    fn test_rdn_and_parent() {
        let dn = Dn::new("cn=alice,ou=people,dc=example");
        assert_eq!(dn.rdn(), "cn=alice");
        assert_eq!(dn.parent().unwrap(), Dn::new("ou=people,dc=example"));
        assert_eq!(Dn::new("dc=example").parent().unwrap(), Dn::root());
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_escaped_comma_stays_in_rdn() {
        let dn = Dn::new("cn=Smith\\, John,dc=example");
        assert_eq!(dn.rdn(), "cn=Smith\\, John");
        assert_eq!(dn.parent().unwrap().as_str(), "dc=example");
    }

    #[test]
    fn test_is_within() {
        let base = Dn::new("dc=example,dc=com");
        assert!(Dn::new("cn=a,dc=example,dc=com").is_within(&base));
        assert!(base.is_within(&base));
        assert!(!Dn::new("cn=a,dc=otherexample,dc=com").is_within(&base));
        assert!(!Dn::new("dc=com").is_within(&base));
    }

    #[test]
    fn test_conflict_dn_is_deterministic() {
        let base = Dn::new("dc=example");
        let expected = Dn::new("cn=alice,ou=people,dc=example");
        let dn = Dn::conflict_dn(&base, "1234", &expected);
        assert_eq!(
            dn.as_str(),
            "entryuuid=1234+cn=alice,cn=replication conflicts,dc=example"
        );
        assert!(dn.is_within(&Dn::conflict_container(&base)));
    }

    #[test]
    fn test_index_key_is_case_insensitive() {
        assert_eq!(
            Dn::new("cn=Alice,dc=example").index_key(),
            Dn::new("CN=alice,DC=Example").index_key()
        );
    }
}
