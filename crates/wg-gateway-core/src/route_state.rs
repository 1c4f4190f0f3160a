//! Reachability derived from live observation
//!
//! A read-mostly view of which prefixes are reachable through which peer,
//! rebuilt from the registry snapshot and the latest liveness observation on
//! every pass.

use crate::keys::WgKey;
use crate::prefix::PrefixSet;
use crate::types::{Peer, PeerId};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv6Addr;

/// A handshake older than this no longer counts (WireGuard reject-after-time)
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 180;

/// What the subsystems reported on the last observation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessSnapshot {
    /// Unix time of the observation
    pub observed_at: u64,
    /// Last handshake per peer key, unix seconds (0 = never)
    pub handshakes: BTreeMap<WgKey, u64>,
    /// Tunnel addresses of OSPF neighbors in Full state
    pub ospf_neighbors: BTreeSet<Ipv6Addr>,
    /// Prefixes currently installed by OSPF
    pub learned_prefixes: BTreeSet<IpNet>,
}

impl LivenessSnapshot {
    /// Empty snapshot taken at `observed_at`
    pub fn at(observed_at: u64) -> Self {
        Self {
            observed_at,
            ..Default::default()
        }
    }

    pub fn handshake_fresh(&self, key: &WgKey) -> bool {
        match self.handshakes.get(key) {
            Some(0) | None => false,
            Some(at) => self.observed_at.saturating_sub(*at) <= HANDSHAKE_TIMEOUT_SECS,
        }
    }

    pub fn is_adjacent(&self, addr: &Ipv6Addr) -> bool {
        self.ospf_neighbors.contains(addr)
    }
}

/// Reachability through one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReachability {
    pub peer_id: PeerId,
    pub link_up: bool,
    /// OSPF adjacency is Full
    pub adjacent: bool,
    /// Advertised prefixes OSPF actually installed via this peer
    pub reachable: PrefixSet,
}

/// Derived route view for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteState {
    pub peers: Vec<PeerReachability>,
    reachable: PrefixSet,
}

impl RouteState {
    /// Link state of a single peer from the observation
    pub fn link_up(peer: &Peer, liveness: &LivenessSnapshot) -> bool {
        let Some(key) = peer.public_key.as_ref() else {
            return false;
        };
        liveness.handshake_fresh(key) || Self::adjacent(peer, liveness)
    }

    fn adjacent(peer: &Peer, liveness: &LivenessSnapshot) -> bool {
        peer.is_usable()
            && peer
                .tunnel_address
                .as_ref()
                .is_some_and(|addr| liveness.is_adjacent(addr))
    }

    /// Build the view from a registry snapshot (ordered by peer id)
    pub fn derive(peers: &[Peer], liveness: &LivenessSnapshot) -> Self {
        let mut reachable = PrefixSet::new();
        let peers = peers
            .iter()
            .filter(|p| p.is_usable())
            .map(|peer| {
                let adjacent = Self::adjacent(peer, liveness);
                let via_peer = if adjacent {
                    peer.advertised_prefixes
                        .intersection(&liveness.learned_prefixes)
                } else {
                    PrefixSet::new()
                };
                reachable.extend(&via_peer);
                PeerReachability {
                    peer_id: peer.peer_id.clone(),
                    link_up: Self::link_up(peer, liveness),
                    adjacent,
                    reachable: via_peer,
                }
            })
            .collect();

        Self { peers, reachable }
    }

    /// Union of reachable prefixes across peers
    pub fn reachable(&self) -> &PrefixSet {
        &self.reachable
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    pub fn link_up_count(&self) -> usize {
        self.peers.iter().filter(|p| p.link_up).count()
    }

    pub fn adjacency_count(&self) -> usize {
        self.peers.iter().filter(|p| p.adjacent).count()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerReachability> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }
}
