//! gatewayd - WireGuard/OSPF/VRRP Gateway Reconciler
//!
//! This daemon provides:
//! - Persistent WireGuard identity
//! - Peer tracking from relation snapshots
//! - Full-resync reconciliation of WireGuard, BIRD and Keepalived
//! - Coalescing trigger queue with periodic health ticks
//! - Advertisement and status publication

pub mod applier;
pub mod config;
pub mod keystore;
pub mod network;
pub mod queue;
pub mod reconciler;
pub mod relation;
pub mod server;
pub mod status;
pub mod storage;
pub mod subsystem;

pub use applier::{Applier, ApplyResult};
pub use config::Config;
pub use keystore::KeyStore;
pub use queue::{Trigger, TriggerQueue};
pub use reconciler::{PassReport, Reconciler, ReconcilerState};
pub use server::Server;
pub use storage::Storage;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
