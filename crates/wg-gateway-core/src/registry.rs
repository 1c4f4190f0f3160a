//! Registry of remote gateways
//!
//! Populated only from relation events. All peer-supplied fields are
//! untrusted: each one is validated on its own, and a rejected field keeps
//! the last good value instead of discarding the peer.

use crate::error::{Error, Result};
use crate::keys::WgKey;
use crate::prefix::PrefixSet;
use crate::types::{parse_tunnel_address, Endpoint, Peer, PeerId, PeerUpdate};
use std::collections::BTreeMap;

/// A field dropped during upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRejection {
    pub field: &'static str,
    pub error: Error,
}

/// Result of applying one relation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub peer_id: PeerId,
    pub created: bool,
    pub changed: bool,
    pub rejected: Vec<FieldRejection>,
}

/// Apply one optional raw field. Empty clears, `None` keeps.
fn apply_field<T, F>(
    slot: &mut Option<T>,
    raw: Option<&str>,
    field: &'static str,
    parse: F,
    rejected: &mut Vec<FieldRejection>,
) where
    F: FnOnce(&str) -> Result<T>,
{
    match raw.map(str::trim) {
        None => {}
        Some("") => *slot = None,
        Some(value) => match parse(value) {
            Ok(parsed) => *slot = Some(parsed),
            Err(error) => rejected.push(FieldRejection { field, error }),
        },
    }
}

/// Known peers indexed by relation identity
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer from a relation record.
    ///
    /// Fails only when the peer id itself is unusable.
    pub fn upsert(&mut self, update: &PeerUpdate) -> Result<UpsertOutcome> {
        let peer_id = PeerId::new(update.peer_id.trim())?;
        let created = !self.peers.contains_key(&peer_id);
        let peer = self
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| Peer::new(peer_id.clone()));
        let before = peer.clone();
        let mut rejected = Vec::new();

        apply_field(
            &mut peer.public_key,
            update.public_key.as_deref(),
            "public-key",
            WgKey::from_base64,
            &mut rejected,
        );
        apply_field(
            &mut peer.endpoint,
            update.endpoint.as_deref(),
            "endpoint",
            |v| v.parse::<Endpoint>(),
            &mut rejected,
        );
        apply_field(
            &mut peer.tunnel_address,
            update.tunnel_address.as_deref(),
            "tunnel-address",
            parse_tunnel_address,
            &mut rejected,
        );
        if let Some(raw) = update.advertise_prefixes.as_deref() {
            match PrefixSet::parse_list(raw) {
                Ok(prefixes) => peer.advertised_prefixes = prefixes,
                Err(error) => rejected.push(FieldRejection {
                    field: "advertise-prefixes",
                    error,
                }),
            }
        }

        // A new key means a new tunnel; liveness must be re-proven
        if peer.public_key != before.public_key {
            peer.link_up = false;
        }

        Ok(UpsertOutcome {
            peer_id,
            created,
            changed: created || *peer != before,
            rejected,
        })
    }

    /// Drop a peer; derived state is recomputed on the next render
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Snapshot ordered by peer id
    pub fn list(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers with a public key
    pub fn usable_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_usable()).count()
    }

    /// Record observed link state. Returns whether it changed.
    pub fn set_link_state(&mut self, peer_id: &PeerId, up: bool) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.link_up != up => {
                peer.link_up = up;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> String {
        WgKey([n; 32]).to_base64()
    }

    fn full_update(id: &str) -> PeerUpdate {
        PeerUpdate {
            peer_id: id.to_string(),
            public_key: Some(key(1)),
            endpoint: Some("172.16.0.2:51820".into()),
            tunnel_address: Some("fe80::2".into()),
            advertise_prefixes: Some("198.51.100.0/24".into()),
        }
    }

    #[test]
    fn test_upsert_creates_peer() {
        let mut registry = PeerRegistry::new();
        let outcome = registry.upsert(&full_update("b/0")).unwrap();
        assert!(outcome.created);
        assert!(outcome.rejected.is_empty());

        let peer = registry.get(&outcome.peer_id).unwrap();
        assert!(peer.is_usable());
        assert_eq!(peer.advertised_prefixes.len(), 1);
        assert_eq!(peer.endpoint.as_ref().unwrap().port, 51820);
    }

    #[test]
    fn test_invalid_field_keeps_previous_value() {
        let mut registry = PeerRegistry::new();
        registry.upsert(&full_update("b/0")).unwrap();

        let bad = PeerUpdate {
            public_key: Some("garbage".into()),
            advertise_prefixes: Some("198.51.100.0/24, 10.0.0.0/99".into()),
            endpoint: Some("172.16.0.9:4500".into()),
            ..PeerUpdate::new("b/0")
        };
        let outcome = registry.upsert(&bad).unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.rejected.len(), 2);

        let peer = registry.get(&outcome.peer_id).unwrap();
        assert_eq!(peer.public_key, Some(WgKey([1; 32])));
        assert_eq!(peer.advertised_prefixes.to_string(), "198.51.100.0/24");
        // Valid fields in the same record still apply
        assert_eq!(peer.endpoint.as_ref().unwrap().port, 4500);
    }

    #[test]
    fn test_empty_field_clears() {
        let mut registry = PeerRegistry::new();
        registry.upsert(&full_update("b/0")).unwrap();
        let outcome = registry
            .upsert(&PeerUpdate {
                endpoint: Some(String::new()),
                ..PeerUpdate::new("b/0")
            })
            .unwrap();
        assert!(outcome.changed);
        assert!(registry.get(&outcome.peer_id).unwrap().endpoint.is_none());
    }

    #[test]
    fn test_invalid_peer_id_rejected() {
        let mut registry = PeerRegistry::new();
        assert!(registry.upsert(&PeerUpdate::new("")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_sorted_by_id() {
        let mut registry = PeerRegistry::new();
        for id in ["c/0", "a/1", "b/0", "a/0"] {
            registry.upsert(&PeerUpdate::new(id)).unwrap();
        }
        let ids: Vec<String> = registry.list().iter().map(|p| p.peer_id.to_string()).collect();
        assert_eq!(ids, vec!["a/0", "a/1", "b/0", "c/0"]);
    }

    #[test]
    fn test_key_change_resets_link_state() {
        let mut registry = PeerRegistry::new();
        let id = registry.upsert(&full_update("b/0")).unwrap().peer_id;
        assert!(registry.set_link_state(&id, true));
        assert!(!registry.set_link_state(&id, true));

        registry
            .upsert(&PeerUpdate {
                public_key: Some(key(2)),
                ..PeerUpdate::new("b/0")
            })
            .unwrap();
        assert!(!registry.get(&id).unwrap().link_up);
    }

    #[test]
    fn test_remove() {
        let mut registry = PeerRegistry::new();
        let id = registry.upsert(&full_update("b/0")).unwrap().peer_id;
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.usable_count(), 0);
    }
}
