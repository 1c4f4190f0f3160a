//! Core gateway types
//!
//! Everything that arrives from a peer is carried as raw strings in
//! [`PeerUpdate`] and only becomes a typed [`Peer`] field after validation.

use crate::error::{Error, Result};
use crate::keys::WgKey;
use crate::prefix::PrefixSet;
use crate::priority::PriorityPolicy;
use ipnet::{IpNet, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Longest accepted peer identifier
const MAX_PEER_ID_LEN: usize = 128;

/// Longest Linux interface name
const MAX_IFNAME_LEN: usize = 15;

// =============================================================================
// PEERS
// =============================================================================

/// Relation identity of a remote gateway
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a relation identity
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty()
            || value.len() > MAX_PEER_ID_LEN
            || value.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::InvalidPeerId(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote UDP endpoint (`host:port` or `[v6]:port`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    /// Hostname or address, without brackets
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEndpoint(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        let host = if let Some(inner) = host.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
            inner.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            inner
        } else {
            // Unbracketed IPv6 is ambiguous
            if host.is_empty()
                || !host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            {
                return Err(invalid());
            }
            host
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Validate a peer tunnel address: unicast IPv6 only
pub fn parse_tunnel_address(value: &str) -> Result<Ipv6Addr> {
    let invalid = || Error::InvalidTunnelAddress(value.to_string());
    let addr: Ipv6Addr = value.trim().parse().map_err(|_| invalid())?;
    if addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() {
        return Err(invalid());
    }
    Ok(addr)
}

/// A known remote gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    /// Absent until the peer has published a valid key
    pub public_key: Option<WgKey>,
    /// Absent when the peer is behind NAT and dials us
    pub endpoint: Option<Endpoint>,
    /// Peer's address on the tunnel interface
    pub tunnel_address: Option<Ipv6Addr>,
    /// Prefixes the peer claims to reach
    pub advertised_prefixes: PrefixSet,
    /// Derived from handshake / OSPF adjacency on the last observation
    pub link_up: bool,
}

impl Peer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            public_key: None,
            endpoint: None,
            tunnel_address: None,
            advertised_prefixes: PrefixSet::new(),
            link_up: false,
        }
    }

    /// A peer without a key cannot form a tunnel
    pub fn is_usable(&self) -> bool {
        self.public_key.is_some()
    }

    /// Usable and either up or dialable
    pub fn is_established(&self) -> bool {
        self.is_usable() && (self.link_up || self.endpoint.is_some())
    }
}

/// Raw relation record for one remote gateway.
///
/// `None` leaves a field untouched; an empty string clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerUpdate {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_prefixes: Option<String>,
}

impl PeerUpdate {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// LOCAL CONFIGURATION
// =============================================================================

/// Static OSPF parameters, identical for every tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OspfPolicy {
    pub area: Ipv4Addr,
    pub cost: u16,
    pub hello: u16,
    pub dead: u16,
}

impl Default for OspfPolicy {
    fn default() -> Self {
        Self {
            area: Ipv4Addr::UNSPECIFIED,
            cost: 10,
            hello: 5,
            dead: 30,
        }
    }
}

/// VRRP intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrrpPolicy {
    /// Interface carrying the virtual addresses
    pub interface: String,
    pub virtual_router_id: u8,
    pub advert_int: u8,
    /// Virtual addresses with their prefix length
    pub vips: Vec<IpNet>,
    pub priority: PriorityPolicy,
}

/// Operator-supplied configuration, read-only for one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// WireGuard interface name
    pub interface: String,
    pub listen_port: u16,
    /// Local tunnel address
    pub tunnel_address: Ipv6Net,
    pub advertise_prefixes: PrefixSet,
    pub persistent_keepalive: u16,
    pub router_id: Ipv4Addr,
    pub ospf: OspfPolicy,
    pub vrrp: VrrpPolicy,
}

fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_IFNAME_LEN
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidPolicy(format!("bad interface name {:?}", name)));
    }
    Ok(())
}

impl LocalConfig {
    /// Check the parts a daemon would refuse. Missing prefixes are not an
    /// error here; they surface as a blocked status instead.
    pub fn validate(&self) -> Result<()> {
        validate_ifname(&self.interface)?;
        validate_ifname(&self.vrrp.interface)?;
        if self.listen_port == 0 {
            return Err(Error::InvalidPolicy("listen port must be non-zero".into()));
        }
        if self.ospf.hello == 0 || self.ospf.dead <= self.ospf.hello {
            return Err(Error::InvalidPolicy(
                "ospf dead interval must exceed hello interval".into(),
            ));
        }
        if self.vrrp.virtual_router_id == 0 || self.vrrp.advert_int == 0 {
            return Err(Error::InvalidPolicy(
                "virtual router id and advert interval must be non-zero".into(),
            ));
        }
        self.vrrp.priority.validate()
    }

    /// Reason this configuration blocks the gateway, if any
    pub fn blocked_reason(&self) -> Option<&'static str> {
        if self.advertise_prefixes.is_empty() {
            Some("no advertise-prefixes configured")
        } else {
            None
        }
    }
}

/// What this gateway publishes to the relation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalAdvertisement {
    pub public_key: WgKey,
    pub listen_port: u16,
    pub tunnel_address: Ipv6Addr,
    pub advertise_prefixes: String,
}

impl LocalAdvertisement {
    pub fn new(public_key: WgKey, config: &LocalConfig) -> Self {
        Self {
            public_key,
            listen_port: config.listen_port,
            tunnel_address: config.tunnel_address.addr(),
            advertise_prefixes: config.advertise_prefixes.to_relation_string(),
        }
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Coarse gateway state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Active,
    Waiting,
    Blocked,
    Degraded,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Active => "active",
            StatusKind::Waiting => "waiting",
            StatusKind::Blocked => "blocked",
            StatusKind::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Structured status published after each pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub kind: StatusKind,
    pub message: String,
    pub priority: u8,
    pub peer_count: usize,
    pub link_up_count: usize,
    pub reachable_prefixes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl GatewayStatus {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            priority: 0,
            peer_count: 0,
            link_up_count: 0,
            reachable_prefixes: 0,
            fingerprint: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.kind == StatusKind::Active
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Host route covering a single address
pub fn host_route(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_validation() {
        assert!(PeerId::new("wireguard-b/0").is_ok());
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("has space").is_err());
        assert!(PeerId::new("x".repeat(200)).is_err());
    }

    #[test]
    fn test_endpoint_parsing() {
        let ep: Endpoint = "172.16.0.2:51820".parse().unwrap();
        assert_eq!(ep.port, 51820);
        assert_eq!(ep.to_string(), "172.16.0.2:51820");

        let ep: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");

        let ep: Endpoint = "gw-b.example.net:4500".parse().unwrap();
        assert_eq!(ep.host, "gw-b.example.net");

        assert!("2001:db8::1:51820".parse::<Endpoint>().is_err());
        assert!("host:0".parse::<Endpoint>().is_err());
        assert!("host".parse::<Endpoint>().is_err());
        assert!(":51820".parse::<Endpoint>().is_err());
        assert!("bad host;rm:1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_tunnel_address() {
        assert!(parse_tunnel_address("fe80::2").is_ok());
        assert!(parse_tunnel_address("169.254.0.2").is_err());
        assert!(parse_tunnel_address("::").is_err());
        assert!(parse_tunnel_address("ff02::5").is_err());
    }

    #[test]
    fn test_established() {
        let mut peer = Peer::new(PeerId::new("b/0").unwrap());
        assert!(!peer.is_established());
        peer.public_key = Some(WgKey([1; 32]));
        assert!(!peer.is_established());
        peer.link_up = true;
        assert!(peer.is_established());
    }

    #[test]
    fn test_peer_update_kebab_case() {
        let json = r#"{"peer-id":"b/0","public-key":"k","advertise-prefixes":"10.0.0.0/8"}"#;
        let update: PeerUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.peer_id, "b/0");
        assert_eq!(update.advertise_prefixes.as_deref(), Some("10.0.0.0/8"));
        assert!(update.endpoint.is_none());
    }

    #[test]
    fn test_status_display() {
        let status = GatewayStatus::new(StatusKind::Blocked, "no advertise-prefixes configured");
        assert_eq!(status.to_string(), "blocked: no advertise-prefixes configured");
        assert_eq!(GatewayStatus::new(StatusKind::Active, "").to_string(), "active");
    }
}
