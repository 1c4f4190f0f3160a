//! Command surface of the managed daemons
//!
//! One trait per subsystem. The applier only talks to these traits, so the
//! same reconciliation logic drives the real host (`system`) or an
//! in-memory stand-in (`memory`) used for dry runs and tests.

pub mod memory;
pub mod system;

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::net::Ipv6Addr;
use std::path::Path;
use thiserror::Error;
use wg_gateway_core::render::{LivePeer, WireguardConfig, WireguardPeer};
use wg_gateway_core::WgKey;

/// Subsystem command errors
#[derive(Debug, Error)]
pub enum SubsystemError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Parse error: {0}")]
    Parse(String),
}

/// The three managed subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    Wireguard,
    Routing,
    Vrrp,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Subsystem::Wireguard => "wireguard",
            Subsystem::Routing => "bird",
            Subsystem::Vrrp => "keepalived",
        };
        f.write_str(s)
    }
}

/// Tunnel interface as read back from the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveInterface {
    /// Derived from the configured private key
    pub public_key: Option<WgKey>,
    pub listen_port: u16,
    pub addresses: Vec<IpNet>,
    pub up: bool,
    pub peers: Vec<LivePeer>,
}

impl LiveInterface {
    /// Whether interface-level settings match the target
    pub fn matches(&self, target: &WireguardConfig) -> bool {
        self.up
            && self.public_key == Some(target.private_key.public_key())
            && self.listen_port == target.listen_port
            && self.addresses.contains(&IpNet::V6(target.address))
    }
}

/// WireGuard control
pub trait WireguardControl: Send {
    /// Current interface state, `None` when the interface does not exist
    fn read(&mut self, interface: &str) -> Result<Option<LiveInterface>, SubsystemError>;

    /// Create the interface if needed and set key, port and address
    fn ensure_interface(&mut self, target: &WireguardConfig) -> Result<(), SubsystemError>;

    /// Add or replace one peer
    fn set_peer(&mut self, interface: &str, peer: &WireguardPeer) -> Result<(), SubsystemError>;

    fn remove_peer(&mut self, interface: &str, key: &WgKey) -> Result<(), SubsystemError>;
}

/// BIRD control
pub trait RoutingControl: Send {
    /// Installed configuration text, `None` when absent
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError>;

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError>;

    /// Reload configuration without restarting the daemon
    fn reload(&mut self) -> Result<(), SubsystemError>;

    /// Router addresses of neighbors in Full state
    fn full_neighbors(&mut self) -> Result<BTreeSet<Ipv6Addr>, SubsystemError>;

    /// Prefixes installed by OSPF
    fn learned_prefixes(&mut self) -> Result<BTreeSet<IpNet>, SubsystemError>;

    /// Installed forwarding sysctl drop-in, `None` when absent
    fn read_forwarding(&mut self) -> Result<Option<String>, SubsystemError>;

    fn write_forwarding(&mut self, text: &str) -> Result<(), SubsystemError>;

    /// Load all sysctl drop-ins into the running kernel
    fn load_sysctl(&mut self) -> Result<(), SubsystemError>;
}

/// Keepalived control
pub trait VrrpControl: Send {
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError>;

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError>;

    fn is_running(&mut self) -> Result<bool, SubsystemError>;

    fn reload(&mut self) -> Result<(), SubsystemError>;

    fn start(&mut self) -> Result<(), SubsystemError>;
}

/// Replace a file in one rename so readers never see a partial write
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)?
    };
    #[cfg(not(unix))]
    let mut file = {
        let _ = mode;
        std::fs::File::create(&tmp)?
    };

    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}
