//! Configuration rendering
//!
//! Pure mapping from (identity, local config, peer snapshot, liveness) to
//! the three daemon documents. No I/O happens here; identical inputs
//! always produce byte-identical output.
//!
//! ## Modules
//!
//! - `wireguard` - interface and peer sections, allowed-ips claims
//! - `bird` - OSPFv3 instances for both address families
//! - `keepalived` - VRRP instances carrying the computed priority

pub mod bird;
pub mod keepalived;
pub mod wireguard;

pub use keepalived::KeepalivedConfig;
pub use wireguard::{LivePeer, TunnelConflict, WireguardConfig, WireguardPeer};

use crate::keys::LocalIdentity;
use crate::route_state::{LivenessSnapshot, RouteState};
use crate::types::{host_route, LocalConfig, Peer};
use std::net::{IpAddr, Ipv6Addr};

/// Everything one render depends on
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub identity: &'a LocalIdentity,
    pub config: &'a LocalConfig,
    /// Registry snapshot, ordered by peer id
    pub peers: &'a [Peer],
    pub liveness: &'a LivenessSnapshot,
}

/// Rendered targets for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub wireguard: WireguardConfig,
    pub bird: String,
    pub keepalived: KeepalivedConfig,
    /// OSPF neighbor addresses, one per established tunnel
    pub ospf_neighbors: Vec<Ipv6Addr>,
    pub route_state: RouteState,
    pub priority: u8,
    /// Peers whose tunnel address went to someone else
    pub conflicts: Vec<TunnelConflict>,
    /// Forwarding sysctl drop-in for the routing host
    pub forwarding: String,
}

impl RenderedConfig {
    /// Digest over every rendered document
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (name, doc) in [
            ("wireguard", self.wireguard.to_conf()),
            ("address", self.wireguard.address.to_string()),
            ("bird", self.bird.clone()),
            ("keepalived", self.keepalived.text.clone()),
            ("forwarding", self.forwarding.clone()),
        ] {
            hasher.update(name.as_bytes());
            hasher.update(&(doc.len() as u64).to_le_bytes());
            hasher.update(doc.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }
}

/// Established peers that won their tunnel address, in peer id order
fn ospf_neighbors(peers: &[Peer], wireguard: &WireguardConfig) -> Vec<Ipv6Addr> {
    let mut neighbors: Vec<Ipv6Addr> = peers
        .iter()
        .filter(|p| p.is_established())
        .filter_map(|peer| {
            let addr = peer.tunnel_address?;
            let entry = wireguard.peer(peer.public_key.as_ref()?)?;
            (entry.peer_id == peer.peer_id
                && entry.allowed_ips.contains(&host_route(IpAddr::V6(addr))))
            .then_some(addr)
        })
        .collect();
    neighbors.sort();
    neighbors.dedup();
    neighbors
}

/// Render all daemon targets.
///
/// Peers without a public key never get a tunnel. Peer identifiers are
/// not written into any document.
pub fn render(input: RenderInput<'_>) -> RenderedConfig {
    let route_state = RouteState::derive(input.peers, input.liveness);
    let priority = input
        .config
        .vrrp
        .priority
        .priority(route_state.reachable_count());

    let (wireguard, conflicts) =
        wireguard::build(input.identity, input.config, input.peers, &route_state);
    let ospf_neighbors = ospf_neighbors(input.peers, &wireguard);
    let bird = bird::render(input.config, &ospf_neighbors);
    let keepalived = keepalived::render(input.config, priority);

    RenderedConfig {
        wireguard,
        bird,
        keepalived,
        ospf_neighbors,
        route_state,
        priority,
        conflicts,
        forwarding: bird::forwarding_sysctl(),
    }
}
