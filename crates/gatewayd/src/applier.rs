//! Convergence of live daemons onto a rendered target
//!
//! The applier keeps the last target each subsystem accepted. A new target
//! is diffed against that record, or against live state read back from the
//! subsystem when there is no record (first pass, or the previous attempt
//! failed). Only differences turn into commands, so converging twice on
//! the same target is a no-op.
//!
//! Routing covers BIRD and the kernel forwarding sysctl drop-in.
//! The three subsystems are converged independently: a failure in one is
//! recorded in [`ApplyResult`] and does not stop the others.

use crate::subsystem::{
    RoutingControl, Subsystem, SubsystemError, VrrpControl, WireguardControl,
};
use std::fmt;
use tracing::{debug, info, warn};
use wg_gateway_core::render::{KeepalivedConfig, LivePeer, WireguardConfig};
use wg_gateway_core::{LivenessSnapshot, RenderedConfig};

/// What happened to one subsystem during a pass
#[derive(Debug)]
pub enum Outcome {
    /// Already converged, nothing issued
    Unchanged,
    /// Operations issued, all succeeded
    Changed(Vec<String>),
    /// An operation failed; `completed` ran before it
    Failed {
        error: SubsystemError,
        completed: Vec<String>,
    },
}

impl Outcome {
    fn from_result(result: Result<(), SubsystemError>, ops: Vec<String>) -> Self {
        match result {
            Err(error) => Outcome::Failed {
                error,
                completed: ops,
            },
            Ok(()) if ops.is_empty() => Outcome::Unchanged,
            Ok(()) => Outcome::Changed(ops),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    /// Operations that took effect
    pub fn operations(&self) -> &[String] {
        match self {
            Outcome::Unchanged => &[],
            Outcome::Changed(ops) => ops,
            Outcome::Failed { completed, .. } => completed,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Changed(ops) => write!(f, "changed ({})", ops.join(", ")),
            Outcome::Failed { error, .. } => write!(f, "failed ({})", error),
        }
    }
}

/// Per-subsystem outcome of one `converge`
#[derive(Debug)]
pub struct ApplyResult {
    pub wireguard: Outcome,
    pub routing: Outcome,
    pub vrrp: Outcome,
}

impl ApplyResult {
    pub fn outcomes(&self) -> [(Subsystem, &Outcome); 3] {
        [
            (Subsystem::Wireguard, &self.wireguard),
            (Subsystem::Routing, &self.routing),
            (Subsystem::Vrrp, &self.vrrp),
        ]
    }

    pub fn is_success(&self) -> bool {
        self.outcomes().iter().all(|(_, o)| !o.is_failed())
    }

    pub fn failures(&self) -> Vec<(Subsystem, &SubsystemError)> {
        self.outcomes()
            .into_iter()
            .filter_map(|(subsystem, outcome)| match outcome {
                Outcome::Failed { error, .. } => Some((subsystem, error)),
                _ => None,
            })
            .collect()
    }

    /// Total operations that took effect
    pub fn mutations(&self) -> usize {
        self.outcomes()
            .iter()
            .map(|(_, o)| o.operations().len())
            .sum()
    }
}

/// Last target each subsystem accepted
#[derive(Debug, Default)]
struct AppliedRecord {
    wireguard: Option<WireguardConfig>,
    bird: Option<String>,
    forwarding: Option<String>,
    keepalived: Option<KeepalivedConfig>,
}

/// Drives the three subsystems
pub struct Applier {
    wireguard: Box<dyn WireguardControl>,
    routing: Box<dyn RoutingControl>,
    vrrp: Box<dyn VrrpControl>,
    applied: AppliedRecord,
}

impl Applier {
    pub fn new(
        wireguard: Box<dyn WireguardControl>,
        routing: Box<dyn RoutingControl>,
        vrrp: Box<dyn VrrpControl>,
    ) -> Self {
        Self {
            wireguard,
            routing,
            vrrp,
            applied: AppliedRecord::default(),
        }
    }

    /// Read handshakes and OSPF state. Read failures leave the affected
    /// part of the snapshot empty.
    pub fn observe(&mut self, interface: &str, observed_at: u64) -> LivenessSnapshot {
        let mut snapshot = LivenessSnapshot::at(observed_at);

        match self.wireguard.read(interface) {
            Ok(Some(live)) => {
                for peer in live.peers {
                    snapshot
                        .handshakes
                        .insert(peer.public_key, peer.latest_handshake);
                }
            }
            Ok(None) => debug!("Interface {} not present yet", interface),
            Err(e) => warn!("WireGuard read failed: {}", e),
        }

        match self.routing.full_neighbors() {
            Ok(neighbors) => snapshot.ospf_neighbors = neighbors,
            Err(e) => warn!("OSPF neighbor read failed: {}", e),
        }
        match self.routing.learned_prefixes() {
            Ok(prefixes) => snapshot.learned_prefixes = prefixes,
            Err(e) => warn!("OSPF route read failed: {}", e),
        }

        snapshot
    }

    /// Converge all three subsystems onto `rendered`
    pub fn converge(&mut self, rendered: &RenderedConfig) -> ApplyResult {
        let wireguard = self.converge_wireguard(&rendered.wireguard);
        let routing = self.converge_routing(&rendered.bird, &rendered.forwarding);
        let vrrp = self.converge_vrrp(&rendered.keepalived);

        let result = ApplyResult {
            wireguard,
            routing,
            vrrp,
        };
        for (subsystem, outcome) in result.outcomes() {
            match outcome {
                Outcome::Unchanged => debug!("{}: {}", subsystem, outcome),
                Outcome::Changed(_) => info!("{}: {}", subsystem, outcome),
                Outcome::Failed { .. } => warn!("{}: {}", subsystem, outcome),
            }
        }
        result
    }

    fn converge_wireguard(&mut self, target: &WireguardConfig) -> Outcome {
        let mut ops = Vec::new();
        let result = self.sync_wireguard(target, &mut ops);
        self.applied.wireguard = result.is_ok().then(|| target.clone());
        Outcome::from_result(result, ops)
    }

    fn sync_wireguard(
        &mut self,
        target: &WireguardConfig,
        ops: &mut Vec<String>,
    ) -> Result<(), SubsystemError> {
        let record = self
            .applied
            .wireguard
            .as_ref()
            .filter(|prev| prev.interface == target.interface);

        let (interface_ok, current): (bool, Vec<LivePeer>) = match record {
            Some(prev) => (
                prev.address == target.address
                    && prev.private_key == target.private_key
                    && prev.listen_port == target.listen_port,
                prev.peers.iter().map(LivePeer::from).collect(),
            ),
            None => match self.wireguard.read(&target.interface)? {
                Some(live) => (live.matches(target), live.peers),
                None => (false, Vec::new()),
            },
        };

        let ifname = target.interface.as_str();
        if !interface_ok {
            self.wireguard.ensure_interface(target)?;
            ops.push(format!("configure interface {}", ifname));
        }

        // Removals first so freed allowed-ips can move to their new owner
        for peer in &current {
            if target.peer(&peer.public_key).is_none() {
                self.wireguard.remove_peer(ifname, &peer.public_key)?;
                ops.push(format!("remove peer {}", peer.public_key.short()));
            }
        }

        for peer in &target.peers {
            let satisfied = current
                .iter()
                .find(|c| c.public_key == peer.public_key)
                .is_some_and(|c| peer.satisfied_by(c));
            if !satisfied {
                self.wireguard.set_peer(ifname, peer)?;
                ops.push(format!(
                    "set peer {} ({})",
                    peer.public_key.short(),
                    peer.peer_id
                ));
            }
        }
        Ok(())
    }

    fn converge_routing(&mut self, bird: &str, forwarding: &str) -> Outcome {
        let mut ops = Vec::new();
        let result = self
            .sync_forwarding(forwarding, &mut ops)
            .and_then(|()| self.sync_routing(bird, &mut ops));
        let ok = result.is_ok();
        self.applied.forwarding = ok.then(|| forwarding.to_string());
        self.applied.bird = ok.then(|| bird.to_string());
        Outcome::from_result(result, ops)
    }

    /// Kernel forwarding drop-in, loaded with `sysctl --system` when it changes
    fn sync_forwarding(
        &mut self,
        text: &str,
        ops: &mut Vec<String>,
    ) -> Result<(), SubsystemError> {
        let unchanged = match &self.applied.forwarding {
            Some(prev) => prev == text,
            None => self.routing.read_forwarding()?.as_deref() == Some(text),
        };
        if unchanged {
            return Ok(());
        }

        self.routing.write_forwarding(text)?;
        ops.push("write sysctl drop-in".to_string());
        self.routing.load_sysctl()?;
        ops.push("sysctl --system".to_string());
        Ok(())
    }

    fn sync_routing(&mut self, text: &str, ops: &mut Vec<String>) -> Result<(), SubsystemError> {
        let unchanged = match &self.applied.bird {
            Some(prev) => prev == text,
            None => self.routing.read_config()?.as_deref() == Some(text),
        };
        if unchanged {
            return Ok(());
        }

        self.routing.write_config(text)?;
        ops.push("write bird.conf".to_string());
        self.routing.reload()?;
        ops.push("birdc configure".to_string());
        Ok(())
    }

    fn converge_vrrp(&mut self, target: &KeepalivedConfig) -> Outcome {
        let mut ops = Vec::new();
        let result = self.sync_vrrp(target, &mut ops);
        self.applied.keepalived = result.is_ok().then(|| target.clone());
        Outcome::from_result(result, ops)
    }

    fn sync_vrrp(
        &mut self,
        target: &KeepalivedConfig,
        ops: &mut Vec<String>,
    ) -> Result<(), SubsystemError> {
        let previous_priority = self.applied.keepalived.as_ref().map(|k| k.priority);
        let unchanged = match &self.applied.keepalived {
            Some(prev) => prev.text == target.text,
            None => self.vrrp.read_config()?.as_deref() == Some(target.text.as_str()),
        };
        let running = self.vrrp.is_running()?;

        if !unchanged {
            self.vrrp.write_config(&target.text)?;
            ops.push("write keepalived.conf".to_string());
            if let Some(previous) = previous_priority.filter(|p| *p != target.priority) {
                info!("VRRP priority {} -> {}", previous, target.priority);
            }
        }

        if !running {
            self.vrrp.start()?;
            ops.push("start keepalived".to_string());
        } else if !unchanged {
            self.vrrp.reload()?;
            ops.push("reload keepalived".to_string());
        }
        Ok(())
    }
}
