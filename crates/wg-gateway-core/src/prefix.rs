//! CIDR prefix sets
//!
//! Prefixes are parsed non-strictly (host bits are cleared), deduplicated
//! and kept sorted so that anything rendered from them is deterministic.

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Parse one prefix. A bare address is taken as a host route.
pub fn parse_prefix(value: &str) -> Result<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| Error::InvalidPrefix {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Ordered, deduplicated set of prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixSet(BTreeSet<IpNet>);

impl PrefixSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parse a comma-separated list, as carried in relation data.
    /// An empty or blank string is the empty set; any bad entry fails the
    /// whole list.
    pub fn parse_list(value: &str) -> Result<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(parse_prefix)
            .collect()
    }

    pub fn insert(&mut self, prefix: IpNet) -> bool {
        self.0.insert(prefix.trunc())
    }

    pub fn contains(&self, prefix: &IpNet) -> bool {
        self.0.contains(prefix)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.0.iter()
    }

    /// IPv4 members in order
    pub fn ipv4(&self) -> impl Iterator<Item = &IpNet> {
        self.0.iter().filter(|p| matches!(p, IpNet::V4(_)))
    }

    /// IPv6 members in order
    pub fn ipv6(&self) -> impl Iterator<Item = &IpNet> {
        self.0.iter().filter(|p| matches!(p, IpNet::V6(_)))
    }

    /// Members also present in `other`
    pub fn intersection(&self, other: &BTreeSet<IpNet>) -> PrefixSet {
        Self(self.0.intersection(other).copied().collect())
    }

    /// Add every member of `other`
    pub fn extend(&mut self, other: &PrefixSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Serialize as the comma-separated relation form
    pub fn to_relation_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PrefixSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&items.join(", "))
    }
}

impl FromIterator<IpNet> for PrefixSet {
    fn from_iter<I: IntoIterator<Item = IpNet>>(iter: I) -> Self {
        Self(iter.into_iter().map(|p| p.trunc()).collect())
    }
}

impl<'a> IntoIterator for &'a PrefixSet {
    type Item = &'a IpNet;
    type IntoIter = std::collections::btree_set::Iter<'a, IpNet>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
