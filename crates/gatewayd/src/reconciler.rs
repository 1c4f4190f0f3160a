//! Reconciliation passes
//!
//! Every trigger leads to a full pass: gather identity, peers and live
//! liveness, render all three targets, converge, publish. There is no
//! incremental patching and no terminal error state; a pass that ends
//! degraded is simply retried by the next trigger.

use crate::applier::{Applier, ApplyResult};
use crate::keystore::KeyStore;
use crate::queue::Trigger;
use crate::status::Publisher;
use crate::unix_now;
use std::fmt;
use tracing::{debug, error, info, warn};
use wg_gateway_core::render::{render, RenderInput, RenderedConfig};
use wg_gateway_core::{
    GatewayStatus, LocalAdvertisement, LocalConfig, PeerRegistry, RouteState, StatusKind,
};

/// Where the reconciler is in its pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Gathering,
    Rendering,
    Applying,
    Publishing,
    /// Last pass failed partially; the next trigger retries
    Degraded,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcilerState::Idle => "idle",
            ReconcilerState::Gathering => "gathering",
            ReconcilerState::Rendering => "rendering",
            ReconcilerState::Applying => "applying",
            ReconcilerState::Publishing => "publishing",
            ReconcilerState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Summary of one pass
#[derive(Debug)]
pub struct PassReport {
    pub reason: String,
    pub status: GatewayStatus,
    /// Absent when the pass stopped before applying
    pub apply: Option<ApplyResult>,
    pub fingerprint: Option<String>,
}

/// Owner of the registry, the local config and the applier
pub struct Reconciler {
    keystore: KeyStore,
    registry: PeerRegistry,
    config: LocalConfig,
    applier: Applier,
    publisher: Box<dyn Publisher>,
    state: ReconcilerState,
    last_status: Option<GatewayStatus>,
    passes: u64,
}

/// Distinct trigger descriptions in arrival order
fn describe(batch: &[Trigger]) -> String {
    let mut reasons: Vec<String> = Vec::new();
    for trigger in batch {
        let reason = trigger.to_string();
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    reasons.join(", ")
}

impl Reconciler {
    pub fn new(
        keystore: KeyStore,
        config: LocalConfig,
        applier: Applier,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            keystore,
            registry: PeerRegistry::new(),
            config,
            applier,
            publisher,
            state: ReconcilerState::Idle,
            last_status: None,
            passes: 0,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn last_status(&self) -> Option<&GatewayStatus> {
        self.last_status.as_ref()
    }

    /// What peers need to reach us, once the identity is loaded
    pub fn advertisement(&self) -> Option<LocalAdvertisement> {
        self.keystore
            .public_key()
            .map(|key| LocalAdvertisement::new(key, &self.config))
    }

    /// Apply the payloads of a batch in order, then run one pass
    pub fn handle(&mut self, batch: Vec<Trigger>) -> PassReport {
        let reason = describe(&batch);
        for trigger in batch {
            self.absorb(trigger);
        }
        self.reconcile(&reason)
    }

    fn absorb(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Startup | Trigger::Tick => {}
            Trigger::ConfigChanged(config) => match config.validate() {
                Ok(()) if *config != self.config => {
                    info!("Local configuration changed");
                    self.config = *config;
                }
                Ok(()) => debug!("Configuration unchanged"),
                Err(e) => warn!("Rejected configuration change: {}", e),
            },
            Trigger::PeerUpsert(update) => match self.registry.upsert(&update) {
                Ok(outcome) => {
                    for rejection in &outcome.rejected {
                        warn!(
                            "Peer {}: rejected {}: {}",
                            outcome.peer_id, rejection.field, rejection.error
                        );
                    }
                    if outcome.created {
                        info!("Peer {} joined", outcome.peer_id);
                    } else if outcome.changed {
                        info!("Peer {} changed", outcome.peer_id);
                    }
                }
                Err(e) => warn!("Ignoring relation record: {}", e),
            },
            Trigger::PeerRemove(peer_id) => {
                if self.registry.remove(&peer_id).is_some() {
                    info!("Peer {} left", peer_id);
                } else {
                    debug!("Peer {} already gone", peer_id);
                }
            }
        }
    }

    /// One full gather, render, apply and publish pass
    pub fn reconcile(&mut self, reason: &str) -> PassReport {
        self.passes += 1;
        self.state = ReconcilerState::Gathering;

        let identity = match self.keystore.ensure_identity(self.config.listen_port) {
            Ok(identity) => identity,
            Err(e) => {
                error!("Identity unavailable: {}", e);
                let status = GatewayStatus {
                    peer_count: self.registry.len(),
                    ..GatewayStatus::new(
                        StatusKind::Degraded,
                        format!("identity unavailable: {}", e),
                    )
                };
                return self.finish(reason, None, status, None, None);
            }
        };

        let liveness = self.applier.observe(&self.config.interface, unix_now());
        for peer in self.registry.list() {
            let up = RouteState::link_up(&peer, &liveness);
            if self.registry.set_link_state(&peer.peer_id, up) {
                info!("Peer {} link {}", peer.peer_id, if up { "up" } else { "down" });
            }
        }
        let peers = self.registry.list();

        self.state = ReconcilerState::Rendering;
        let rendered = render(RenderInput {
            identity: &identity,
            config: &self.config,
            peers: &peers,
            liveness: &liveness,
        });
        let fingerprint = rendered.fingerprint_hex();
        for conflict in &rendered.conflicts {
            warn!("Tunnel address conflict: {}", conflict);
        }

        self.state = ReconcilerState::Applying;
        let apply = self.applier.converge(&rendered);

        let status = self.evaluate(&rendered, &apply, &fingerprint);
        let advertisement = LocalAdvertisement::new(identity.public_key, &self.config);
        self.finish(
            reason,
            Some(advertisement),
            status,
            Some(apply),
            Some(fingerprint),
        )
    }

    /// Status precedence: degraded, blocked, waiting, active. Among blocked
    /// reasons missing prefixes comes first, then tunnel address conflicts.
    fn evaluate(
        &self,
        rendered: &RenderedConfig,
        apply: &ApplyResult,
        fingerprint: &str,
    ) -> GatewayStatus {
        let (kind, message) = if !apply.is_success() {
            let failed: Vec<String> = apply
                .failures()
                .iter()
                .map(|(subsystem, e)| format!("{}: {}", subsystem, e))
                .collect();
            (
                StatusKind::Degraded,
                format!("apply failed ({})", failed.join("; ")),
            )
        } else if let Some(reason) = self.config.blocked_reason() {
            (StatusKind::Blocked, reason.to_string())
        } else if let Some(conflict) = rendered.conflicts.first() {
            (
                StatusKind::Blocked,
                format!("tunnel address conflict with {}", conflict.peer_id),
            )
        } else if rendered.wireguard.peers.is_empty() {
            (StatusKind::Blocked, "no usable peers".to_string())
        } else if rendered.route_state.adjacency_count() == 0 {
            (StatusKind::Waiting, "waiting for OSPF adjacency".to_string())
        } else {
            (StatusKind::Active, String::new())
        };

        GatewayStatus {
            kind,
            message,
            priority: rendered.priority,
            peer_count: self.registry.len(),
            link_up_count: rendered.route_state.link_up_count(),
            reachable_prefixes: rendered.route_state.reachable_count(),
            fingerprint: Some(fingerprint.to_string()),
        }
    }

    fn finish(
        &mut self,
        reason: &str,
        advertisement: Option<LocalAdvertisement>,
        mut status: GatewayStatus,
        apply: Option<ApplyResult>,
        fingerprint: Option<String>,
    ) -> PassReport {
        self.state = ReconcilerState::Publishing;
        if let Err(e) = self.publisher.publish(advertisement.as_ref(), &status) {
            warn!("Publishing failed: {}", e);
            if status.kind != StatusKind::Degraded {
                status.kind = StatusKind::Degraded;
                status.message = format!("publish failed: {}", e);
            }
        }

        self.state = if status.kind == StatusKind::Degraded {
            ReconcilerState::Degraded
        } else {
            ReconcilerState::Idle
        };

        let changed = self
            .last_status
            .as_ref()
            .map_or(true, |last| last.kind != status.kind || last.message != status.message);
        if changed {
            info!("Status: {}", status);
        }
        info!(
            "Pass {} ({}): fingerprint {}, priority {}, {}",
            self.passes,
            reason,
            fingerprint.as_deref().map_or("-", |f| &f[..f.len().min(12)]),
            status.priority,
            status
        );

        self.last_status = Some(status.clone());
        PassReport {
            reason: reason.to_string(),
            status,
            apply,
            fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PublishError;
    use crate::storage::Storage;
    use crate::subsystem::memory::{MemoryRouting, MemoryVrrp, MemoryWireguard};
    use ipnet::IpNet;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use wg_gateway_core::priority::PriorityPolicy;
    use wg_gateway_core::{OspfPolicy, PeerId, PeerUpdate, PrefixSet, VrrpPolicy};

    struct NullPublisher;

    impl Publisher for NullPublisher {
        fn publish(
            &mut self,
            _advertisement: Option<&LocalAdvertisement>,
            _status: &GatewayStatus,
        ) -> Result<(), PublishError> {
            Ok(())
        }
    }

    struct BrokenPublisher;

    impl Publisher for BrokenPublisher {
        fn publish(
            &mut self,
            _advertisement: Option<&LocalAdvertisement>,
            _status: &GatewayStatus,
        ) -> Result<(), PublishError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
    }

    struct Gateway {
        _dir: TempDir,
        reconciler: Reconciler,
        wireguard: MemoryWireguard,
        routing: MemoryRouting,
        vrrp: MemoryVrrp,
    }

    fn local_config(router_id: &str, tunnel: &str, prefixes: &str) -> LocalConfig {
        LocalConfig {
            interface: "wg0".into(),
            listen_port: 51820,
            tunnel_address: tunnel.parse().unwrap(),
            advertise_prefixes: PrefixSet::parse_list(prefixes).unwrap(),
            persistent_keepalive: 5,
            router_id: router_id.parse().unwrap(),
            ospf: OspfPolicy::default(),
            vrrp: VrrpPolicy {
                interface: "eth0".into(),
                virtual_router_id: 1,
                advert_int: 1,
                vips: vec!["203.0.113.2/24".parse().unwrap()],
                priority: PriorityPolicy::default(),
            },
        }
    }

    fn gateway_with(config: LocalConfig, publisher: Box<dyn Publisher>) -> Gateway {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let wireguard = MemoryWireguard::new();
        let routing = MemoryRouting::new();
        let vrrp = MemoryVrrp::new();
        let applier = Applier::new(
            Box::new(wireguard.clone()),
            Box::new(routing.clone()),
            Box::new(vrrp.clone()),
        );
        Gateway {
            _dir: dir,
            reconciler: Reconciler::new(KeyStore::new(storage), config, applier, publisher),
            wireguard,
            routing,
            vrrp,
        }
    }

    fn gateway(router_id: &str, tunnel: &str, prefixes: &str) -> Gateway {
        gateway_with(
            local_config(router_id, tunnel, prefixes),
            Box::new(NullPublisher),
        )
    }

    /// The relation record a peer would see for `gw`
    fn relation_record(peer_id: &str, gw: &Gateway, endpoint: &str) -> PeerUpdate {
        let adv = gw.reconciler.advertisement().unwrap();
        PeerUpdate {
            public_key: Some(adv.public_key.to_base64()),
            endpoint: Some(endpoint.to_string()),
            tunnel_address: Some(adv.tunnel_address.to_string()),
            advertise_prefixes: Some(adv.advertise_prefixes),
            ..PeerUpdate::new(peer_id)
        }
    }

    fn prefix(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_two_gateway_scenario() {
        let mut a = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let mut b = gateway("172.16.0.11", "fe80::2/64", "198.51.100.0/24");

        // Before peering both are blocked
        let report = a.reconciler.handle(vec![Trigger::Startup]);
        assert_eq!(report.status.kind, StatusKind::Blocked);
        assert_eq!(report.status.message, "no usable peers");
        assert_eq!(report.status.priority, 1);
        let report = b.reconciler.handle(vec![Trigger::Startup]);
        assert_eq!(report.status.kind, StatusKind::Blocked);

        // Relations join
        let a_record = relation_record("gw-a/0", &a, "172.16.0.10:51820");
        let b_record = relation_record("gw-b/0", &b, "172.16.0.11:51820");
        let report = a.reconciler.handle(vec![Trigger::PeerUpsert(b_record)]);
        assert_eq!(report.status.kind, StatusKind::Waiting);
        let report = b.reconciler.handle(vec![Trigger::PeerUpsert(a_record)]);
        assert_eq!(report.status.kind, StatusKind::Waiting);

        assert_eq!(a.wireguard.peers().len(), 1);
        assert_eq!(b.wireguard.peers().len(), 1);
        assert!(a.routing.config().unwrap().contains("        fe80::2;"));
        assert!(b.routing.config().unwrap().contains("        fe80::1;"));

        // OSPF comes up over the tunnel
        a.routing.set_neighbors(["fe80::2".parse().unwrap()]);
        a.routing.set_learned([prefix("198.51.100.0/24")]);
        b.routing.set_neighbors(["fe80::1".parse().unwrap()]);
        b.routing.set_learned([prefix("192.0.2.0/24")]);

        for gw in [&mut a, &mut b] {
            let report = gw.reconciler.handle(vec![Trigger::Tick]);
            assert_eq!(report.status.kind, StatusKind::Active, "{}", report.status);
            assert_eq!(report.status.priority, 110);
            assert_eq!(report.status.link_up_count, 1);
            assert_eq!(report.status.reachable_prefixes, 1);
            assert!(gw.vrrp.config().unwrap().contains("priority 110"));
            assert_eq!(gw.reconciler.state(), ReconcilerState::Idle);
        }
    }

    #[test]
    fn test_shared_tunnel_address_blocks_with_conflict() {
        let mut a = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let mut b = gateway("172.16.0.11", "fe80::1/64", "198.51.100.0/24");
        a.reconciler.handle(vec![Trigger::Startup]);
        b.reconciler.handle(vec![Trigger::Startup]);

        let b_record = relation_record("gw-b/0", &b, "172.16.0.11:51820");
        let report = a.reconciler.handle(vec![Trigger::PeerUpsert(b_record)]);
        assert_eq!(report.status.kind, StatusKind::Blocked);
        assert_eq!(report.status.message, "tunnel address conflict with gw-b/0");
        assert_eq!(
            report.status.to_string(),
            "blocked: tunnel address conflict with gw-b/0"
        );

        // The peer is still configured, only without our address
        let peers = a.wireguard.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].allowed_ips, vec![prefix("198.51.100.0/24")]);

        // Moving b to its key-derived address clears the conflict
        let b_key = b.reconciler.advertisement().unwrap().public_key;
        let moved = local_config("172.16.0.11", "fe80::1/64", "198.51.100.0/24");
        let moved = LocalConfig {
            tunnel_address: b_key.link_local(),
            ..moved
        };
        b.reconciler
            .handle(vec![Trigger::ConfigChanged(Box::new(moved))]);
        let b_record = relation_record("gw-b/0", &b, "172.16.0.11:51820");
        let report = a.reconciler.handle(vec![Trigger::PeerUpsert(b_record)]);
        assert_eq!(report.status.kind, StatusKind::Waiting);
    }

    #[test]
    fn test_key_derived_addresses_reach_adjacency() {
        let mut a = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let mut b = gateway("172.16.0.11", "fe80::1/64", "198.51.100.0/24");
        a.reconciler.handle(vec![Trigger::Startup]);
        b.reconciler.handle(vec![Trigger::Startup]);

        // Both switch from the shared default to their derived address
        for gw in [&mut a, &mut b] {
            let key = gw.reconciler.advertisement().unwrap().public_key;
            let config = LocalConfig {
                tunnel_address: key.link_local(),
                ..gw.reconciler.config().clone()
            };
            gw.reconciler
                .handle(vec![Trigger::ConfigChanged(Box::new(config))]);
        }
        let a_adv = a.reconciler.advertisement().unwrap();
        let b_adv = b.reconciler.advertisement().unwrap();
        assert_ne!(a_adv.tunnel_address, b_adv.tunnel_address);

        let b_record = relation_record("gw-b/0", &b, "172.16.0.11:51820");
        a.routing.set_neighbors([b_adv.tunnel_address]);
        a.routing.set_learned([prefix("198.51.100.0/24")]);
        let report = a.reconciler.handle(vec![Trigger::PeerUpsert(b_record)]);
        assert_eq!(report.status.kind, StatusKind::Active, "{}", report.status);
        assert!(a
            .routing
            .config()
            .unwrap()
            .contains(&format!("        {};", b_adv.tunnel_address)));
    }

    #[test]
    fn test_broken_relation_removes_tunnel_and_drops_priority() {
        let mut a = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let mut b = gateway("172.16.0.11", "fe80::2/64", "198.51.100.0/24");
        a.reconciler.handle(vec![Trigger::Startup]);
        b.reconciler.handle(vec![Trigger::Startup]);

        let b_record = relation_record("gw-b/0", &b, "172.16.0.11:51820");
        a.routing.set_neighbors(["fe80::2".parse().unwrap()]);
        a.routing.set_learned([prefix("198.51.100.0/24")]);
        let report = a.reconciler.handle(vec![Trigger::PeerUpsert(b_record)]);
        assert_eq!(report.status.kind, StatusKind::Active);
        assert_eq!(report.status.priority, 110);

        // Relation broken; OSPF loses the neighbor shortly after
        a.routing.set_neighbors([]);
        a.routing.set_learned([]);
        let report = a
            .reconciler
            .handle(vec![Trigger::PeerRemove(PeerId::new("gw-b/0").unwrap())]);

        assert!(a.wireguard.peers().is_empty());
        assert!(!a.routing.config().unwrap().contains("fe80::2"));
        assert_eq!(report.status.priority, 1);
        assert_eq!(report.status.kind, StatusKind::Blocked);
        assert!(a.vrrp.config().unwrap().contains("priority 1\n"));
    }

    #[test]
    fn test_no_prefixes_blocks_but_still_renders() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "");
        let report = gw.reconciler.handle(vec![Trigger::Startup]);

        assert_eq!(report.status.kind, StatusKind::Blocked);
        assert_eq!(report.status.message, "no advertise-prefixes configured");
        assert_eq!(report.status.to_string(), "blocked: no advertise-prefixes configured");
        assert!(gw.routing.config().is_some());
        assert!(gw.vrrp.config().is_some());
        assert!(gw.wireguard.interface().is_some());

        // Clears once the operator supplies prefixes
        let fixed = local_config("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let report = gw
            .reconciler
            .handle(vec![Trigger::ConfigChanged(Box::new(fixed))]);
        assert_eq!(report.status.message, "no usable peers");
    }

    #[test]
    fn test_invalid_config_change_is_rejected() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let mut bad = local_config("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        bad.interface = "this-name-is-far-too-long".into();

        gw.reconciler
            .handle(vec![Trigger::ConfigChanged(Box::new(bad))]);
        assert_eq!(gw.reconciler.config().interface, "wg0");
    }

    #[test]
    fn test_apply_failure_degrades_then_heals() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        gw.routing.set_failing(true);

        let report = gw.reconciler.handle(vec![Trigger::Startup]);
        assert_eq!(report.status.kind, StatusKind::Degraded);
        assert!(report.status.message.contains("bird"));
        assert_eq!(gw.reconciler.state(), ReconcilerState::Degraded);
        // The other subsystems still converged
        assert!(gw.vrrp.config().is_some());

        gw.routing.set_failing(false);
        let report = gw.reconciler.handle(vec![Trigger::Tick]);
        assert_eq!(report.status.kind, StatusKind::Blocked);
        assert_eq!(gw.reconciler.state(), ReconcilerState::Idle);
    }

    #[test]
    fn test_publish_failure_degrades() {
        let mut gw = gateway_with(
            local_config("172.16.0.10", "fe80::1/64", "192.0.2.0/24"),
            Box::new(BrokenPublisher),
        );
        let report = gw.reconciler.handle(vec![Trigger::Startup]);
        assert_eq!(report.status.kind, StatusKind::Degraded);
        assert!(report.status.message.starts_with("publish failed"));
        assert!(report.apply.unwrap().is_success());
    }

    #[test]
    fn test_batch_applies_payloads_in_order_in_one_pass() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        gw.reconciler.handle(vec![Trigger::Startup]);

        let key = wg_gateway_core::WgKey([2; 32]).to_base64();
        let join = PeerUpdate {
            public_key: Some(key),
            tunnel_address: Some("fe80::2".into()),
            endpoint: Some("172.16.0.11:51820".into()),
            ..PeerUpdate::new("gw-b/0")
        };
        let report = gw.reconciler.handle(vec![
            Trigger::PeerUpsert(join),
            Trigger::Tick,
            Trigger::Tick,
            Trigger::PeerRemove(PeerId::new("gw-b/0").unwrap()),
        ]);

        assert_eq!(report.reason, "peer-changed(gw-b/0), tick, peer-broken(gw-b/0)");
        assert!(gw.reconciler.registry().is_empty());
        assert!(gw.wireguard.peers().is_empty());
    }

    #[test]
    fn test_invalid_peer_fields_do_not_break_the_pass() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let record = PeerUpdate {
            public_key: Some("not-a-key".into()),
            advertise_prefixes: Some("198.51.100.0/24".into()),
            ..PeerUpdate::new("gw-b/0")
        };
        let report = gw.reconciler.handle(vec![Trigger::PeerUpsert(record)]);

        assert_eq!(gw.reconciler.registry().len(), 1);
        assert!(gw.wireguard.peers().is_empty());
        assert_eq!(report.status.message, "no usable peers");
        assert_eq!(report.status.peer_count, 1);
    }

    #[test]
    fn test_idle_tick_is_a_noop() {
        let mut gw = gateway("172.16.0.10", "fe80::1/64", "192.0.2.0/24");
        let first = gw.reconciler.handle(vec![Trigger::Startup]);
        let second = gw.reconciler.handle(vec![Trigger::Tick]);

        assert_eq!(second.apply.unwrap().mutations(), 0);
        assert_eq!(first.fingerprint, second.fingerprint);
    }
}
