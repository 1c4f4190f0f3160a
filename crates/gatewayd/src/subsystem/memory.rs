//! In-memory subsystems
//!
//! Used by `--dry-run` (commands are logged, nothing touches the host) and
//! as test fakes. Handles are cheap clones over shared state so a test can
//! keep one while the applier owns another.

use super::{LiveInterface, RoutingControl, SubsystemError, VrrpControl, WireguardControl};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tracing::info;
use wg_gateway_core::render::{LivePeer, WireguardConfig, WireguardPeer};
use wg_gateway_core::WgKey;

fn injected(command: &str) -> SubsystemError {
    SubsystemError::CommandFailed {
        command: command.to_string(),
        status: 1,
        stderr: "injected failure".to_string(),
    }
}

// =============================================================================
// WIREGUARD
// =============================================================================

#[derive(Debug, Default)]
struct WireguardState {
    interface: Option<LiveInterface>,
    mutations: usize,
    failing: bool,
}

/// Simulated kernel WireGuard interface
#[derive(Debug, Clone, Default)]
pub struct MemoryWireguard {
    state: Arc<Mutex<WireguardState>>,
}

impl MemoryWireguard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state-changing calls so far
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    /// Make every state-changing call fail
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn interface(&self) -> Option<LiveInterface> {
        self.state.lock().interface.clone()
    }

    pub fn peers(&self) -> Vec<LivePeer> {
        self.interface().map(|i| i.peers).unwrap_or_default()
    }

    /// Record a handshake, as the kernel would after traffic
    pub fn set_handshake(&self, key: &WgKey, at: u64) {
        let mut state = self.state.lock();
        if let Some(peer) = state
            .interface
            .as_mut()
            .and_then(|i| i.peers.iter_mut().find(|p| &p.public_key == key))
        {
            peer.latest_handshake = at;
        }
    }
}

impl WireguardControl for MemoryWireguard {
    fn read(&mut self, _interface: &str) -> Result<Option<LiveInterface>, SubsystemError> {
        Ok(self.interface())
    }

    fn ensure_interface(&mut self, target: &WireguardConfig) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("ip link add"));
        }
        state.mutations += 1;
        info!(
            "dry-run: configure {} address {} port {}",
            target.interface, target.address, target.listen_port
        );
        let interface = state.interface.get_or_insert_with(LiveInterface::default);
        interface.public_key = Some(target.private_key.public_key());
        interface.listen_port = target.listen_port;
        interface.addresses = vec![IpNet::V6(target.address)];
        interface.up = true;
        Ok(())
    }

    fn set_peer(&mut self, interface: &str, peer: &WireguardPeer) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("wg set"));
        }
        let Some(live) = state.interface.as_mut() else {
            return Err(SubsystemError::CommandFailed {
                command: "wg set".into(),
                status: 1,
                stderr: format!("Unable to modify interface: No such device ({})", interface),
            });
        };
        info!(
            "dry-run: wg set {} peer {} allowed-ips {:?}",
            interface,
            peer.public_key.short(),
            peer.allowed_ips
        );

        // Allowed IPs move between peers, as in the kernel
        for other in live.peers.iter_mut() {
            if other.public_key != peer.public_key {
                other.allowed_ips.retain(|ip| !peer.allowed_ips.contains(ip));
            }
        }
        let mut next = LivePeer::from(peer);
        match live.peers.iter_mut().find(|p| p.public_key == peer.public_key) {
            Some(existing) => {
                next.latest_handshake = existing.latest_handshake;
                if next.endpoint.is_none() {
                    next.endpoint = existing.endpoint.clone();
                }
                *existing = next;
            }
            None => live.peers.push(next),
        }
        state.mutations += 1;
        Ok(())
    }

    fn remove_peer(&mut self, interface: &str, key: &WgKey) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("wg set remove"));
        }
        info!("dry-run: wg set {} peer {} remove", interface, key.short());
        if let Some(live) = state.interface.as_mut() {
            live.peers.retain(|p| &p.public_key != key);
        }
        state.mutations += 1;
        Ok(())
    }
}

// =============================================================================
// BIRD
// =============================================================================

#[derive(Debug, Default)]
struct RoutingState {
    config: Option<String>,
    forwarding: Option<String>,
    sysctl_loads: usize,
    reloads: usize,
    mutations: usize,
    neighbors: BTreeSet<Ipv6Addr>,
    learned: BTreeSet<IpNet>,
    failing: bool,
}

/// Simulated BIRD daemon
#[derive(Debug, Clone, Default)]
pub struct MemoryRouting {
    state: Arc<Mutex<RoutingState>>,
}

impl MemoryRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn config(&self) -> Option<String> {
        self.state.lock().config.clone()
    }

    pub fn forwarding(&self) -> Option<String> {
        self.state.lock().forwarding.clone()
    }

    pub fn sysctl_loads(&self) -> usize {
        self.state.lock().sysctl_loads
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Neighbors reported in Full state
    pub fn set_neighbors(&self, neighbors: impl IntoIterator<Item = Ipv6Addr>) {
        self.state.lock().neighbors = neighbors.into_iter().collect();
    }

    /// Prefixes reported as installed by OSPF
    pub fn set_learned(&self, learned: impl IntoIterator<Item = IpNet>) {
        self.state.lock().learned = learned.into_iter().collect();
    }
}

impl RoutingControl for MemoryRouting {
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError> {
        Ok(self.config())
    }

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("write bird.conf"));
        }
        info!("dry-run: write bird.conf ({} bytes)", text.len());
        state.config = Some(text.to_string());
        state.mutations += 1;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("birdc configure"));
        }
        info!("dry-run: birdc configure");
        state.reloads += 1;
        state.mutations += 1;
        Ok(())
    }

    fn full_neighbors(&mut self) -> Result<BTreeSet<Ipv6Addr>, SubsystemError> {
        Ok(self.state.lock().neighbors.clone())
    }

    fn learned_prefixes(&mut self) -> Result<BTreeSet<IpNet>, SubsystemError> {
        Ok(self.state.lock().learned.clone())
    }

    fn read_forwarding(&mut self) -> Result<Option<String>, SubsystemError> {
        Ok(self.forwarding())
    }

    fn write_forwarding(&mut self, text: &str) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("write sysctl drop-in"));
        }
        info!("dry-run: write sysctl drop-in ({} bytes)", text.len());
        state.forwarding = Some(text.to_string());
        state.mutations += 1;
        Ok(())
    }

    fn load_sysctl(&mut self) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("sysctl --system"));
        }
        info!("dry-run: sysctl --system");
        state.sysctl_loads += 1;
        state.mutations += 1;
        Ok(())
    }
}

// =============================================================================
// KEEPALIVED
// =============================================================================

#[derive(Debug, Default)]
struct VrrpState {
    config: Option<String>,
    running: bool,
    reloads: usize,
    starts: usize,
    mutations: usize,
    failing: bool,
}

/// Simulated Keepalived service
#[derive(Debug, Clone, Default)]
pub struct MemoryVrrp {
    state: Arc<Mutex<VrrpState>>,
}

impl MemoryVrrp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn config(&self) -> Option<String> {
        self.state.lock().config.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Simulate the service dying
    pub fn stop(&self) {
        self.state.lock().running = false;
    }
}

impl VrrpControl for MemoryVrrp {
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError> {
        Ok(self.config())
    }

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("write keepalived.conf"));
        }
        info!("dry-run: write keepalived.conf ({} bytes)", text.len());
        state.config = Some(text.to_string());
        state.mutations += 1;
        Ok(())
    }

    fn is_running(&mut self) -> Result<bool, SubsystemError> {
        Ok(self.state.lock().running)
    }

    fn reload(&mut self) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("systemctl reload keepalived"));
        }
        info!("dry-run: systemctl reload keepalived");
        state.reloads += 1;
        state.mutations += 1;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SubsystemError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(injected("systemctl start keepalived"));
        }
        info!("dry-run: systemctl start keepalived");
        state.running = true;
        state.starts += 1;
        state.mutations += 1;
        Ok(())
    }
}
