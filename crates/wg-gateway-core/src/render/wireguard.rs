//! WireGuard interface document
//!
//! Rendered in the `wg setconf`/`wg syncconf` format. Interface addressing
//! is carried alongside for the applier but is not part of the text, since
//! `wg` does not accept it.

use crate::keys::{LocalIdentity, PrivateKey, WgKey};
use crate::route_state::{PeerReachability, RouteState};
use crate::types::{host_route, Endpoint, LocalConfig, Peer, PeerId};
use ipnet::{IpNet, Ipv6Net};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// One `[Peer]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireguardPeer {
    /// Relation identity, for logs only
    pub peer_id: PeerId,
    pub public_key: WgKey,
    /// `None` for passive peers that dial us
    pub endpoint: Option<Endpoint>,
    /// Sorted, exclusive to this peer
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

impl WireguardPeer {
    pub fn is_passive(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Whether `live` already carries this peer's settings. A passive
    /// target accepts whatever endpoint the peer roamed in from.
    pub fn satisfied_by(&self, live: &LivePeer) -> bool {
        let mut allowed = live.allowed_ips.clone();
        allowed.sort();
        self.public_key == live.public_key
            && self.allowed_ips == allowed
            && (self.endpoint.is_none() || self.endpoint == live.endpoint)
            && self.persistent_keepalive.unwrap_or(0) == live.persistent_keepalive.unwrap_or(0)
    }
}

/// A peer as read back from the running interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: WgKey,
    pub endpoint: Option<Endpoint>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    /// Unix seconds, 0 = never
    pub latest_handshake: u64,
}

impl From<&WireguardPeer> for LivePeer {
    fn from(peer: &WireguardPeer) -> Self {
        Self {
            public_key: peer.public_key,
            endpoint: peer.endpoint.clone(),
            allowed_ips: peer.allowed_ips.clone(),
            persistent_keepalive: peer.persistent_keepalive,
            latest_handshake: 0,
        }
    }
}

/// Complete WireGuard target for the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireguardConfig {
    pub interface: String,
    pub address: Ipv6Net,
    pub private_key: PrivateKey,
    pub listen_port: u16,
    /// Ordered by peer id
    pub peers: Vec<WireguardPeer>,
}

impl WireguardConfig {
    pub fn peer(&self, key: &WgKey) -> Option<&WireguardPeer> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// `wg` configuration text
    pub fn to_conf(&self) -> String {
        let mut lines = vec![
            "[Interface]".to_string(),
            format!("PrivateKey = {}", self.private_key.to_base64()),
            format!("ListenPort = {}", self.listen_port),
        ];
        for peer in &self.peers {
            lines.push(String::new());
            lines.push("[Peer]".to_string());
            lines.push(format!("PublicKey = {}", peer.public_key));
            if !peer.allowed_ips.is_empty() {
                let ips: Vec<String> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
                lines.push(format!("AllowedIPs = {}", ips.join(", ")));
            }
            if let Some(endpoint) = &peer.endpoint {
                lines.push(format!("Endpoint = {}", endpoint));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                lines.push(format!("PersistentKeepalive = {}", keepalive));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// A peer that lost its tunnel address to someone else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConflict {
    pub peer_id: PeerId,
    pub address: Ipv6Addr,
    /// Peer holding the address, `None` when it is our own
    pub holder: Option<PeerId>,
}

impl fmt::Display for TunnelConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(holder) => write!(
                f,
                "peer {} tunnel address {} already held by {}",
                self.peer_id, self.address, holder
            ),
            None => write!(
                f,
                "peer {} tunnel address {} is our own",
                self.peer_id, self.address
            ),
        }
    }
}

/// Claim rank of one address for one peer, lower wins
fn claim_rank(peer: &Peer, standing: Option<&PeerReachability>, ip: &IpNet) -> u8 {
    match standing {
        Some(s) if s.adjacent && s.reachable.contains(ip) => 0,
        Some(s) if s.adjacent => 1,
        Some(s) if s.link_up => 2,
        None if peer.link_up => 2,
        _ => 3,
    }
}

/// Build the WireGuard target and report tunnel address conflicts.
///
/// Cryptokey routing allows each address on one peer only, so prefixes
/// and tunnel addresses are claimed: adjacent peers that learned the
/// prefix first, then adjacent peers, then link-up peers, then by peer id.
/// The local tunnel address is never claimable.
pub fn build(
    identity: &LocalIdentity,
    config: &LocalConfig,
    peers: &[Peer],
    route_state: &RouteState,
) -> (WireguardConfig, Vec<TunnelConflict>) {
    let standing = |peer: &Peer| route_state.get(&peer.peer_id);

    // One entry per key; the best placed peer keeps a shared key
    let mut order: Vec<&Peer> = peers.iter().filter(|p| p.is_usable()).collect();
    order.sort_by_key(|p| {
        let s = standing(*p);
        (
            !s.is_some_and(|s| s.adjacent),
            !s.map_or(p.link_up, |s| s.link_up),
            p.peer_id.clone(),
        )
    });
    let mut claimed_keys: BTreeSet<WgKey> = BTreeSet::new();
    claimed_keys.insert(identity.public_key);
    let members: Vec<(&Peer, WgKey)> = order
        .into_iter()
        .filter_map(|p| p.public_key.map(|key| (p, key)))
        .filter(|(_, key)| claimed_keys.insert(*key))
        .collect();

    let local = host_route(IpAddr::V6(config.tunnel_address.addr()));
    let mut candidates: Vec<(IpNet, u8, &PeerId)> = Vec::new();
    for &(peer, _) in &members {
        let host = peer.tunnel_address.map(|a| host_route(IpAddr::V6(a)));
        for ip in host.iter().chain(peer.advertised_prefixes.iter()) {
            let rank = claim_rank(peer, standing(peer), ip);
            candidates.push((*ip, rank, &peer.peer_id));
        }
    }
    candidates.sort();

    let mut owners: BTreeMap<IpNet, Option<&PeerId>> = BTreeMap::new();
    owners.insert(local, None);
    for (ip, _, peer_id) in candidates {
        owners.entry(ip).or_insert(Some(peer_id));
    }

    let mut conflicts = Vec::new();
    let mut entries = Vec::new();
    for (peer, public_key) in members {
        let allowed: Vec<IpNet> = owners
            .iter()
            .filter(|(_, owner)| **owner == Some(&peer.peer_id))
            .map(|(ip, _)| *ip)
            .collect();

        if let Some(address) = peer.tunnel_address {
            if let Some(holder) = owners.get(&host_route(IpAddr::V6(address))) {
                if *holder != Some(&peer.peer_id) {
                    conflicts.push(TunnelConflict {
                        peer_id: peer.peer_id.clone(),
                        address,
                        holder: holder.cloned(),
                    });
                }
            }
        }

        let persistent_keepalive = match (&peer.endpoint, config.persistent_keepalive) {
            (Some(_), keepalive) if keepalive > 0 => Some(keepalive),
            _ => None,
        };

        entries.push(WireguardPeer {
            peer_id: peer.peer_id.clone(),
            public_key,
            endpoint: peer.endpoint.clone(),
            allowed_ips: allowed,
            persistent_keepalive,
        });
    }
    entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    conflicts.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

    let wireguard = WireguardConfig {
        interface: config.interface.clone(),
        address: config.tunnel_address,
        private_key: identity.private_key.clone(),
        listen_port: identity.listen_port,
        peers: entries,
    };
    (wireguard, conflicts)
}
