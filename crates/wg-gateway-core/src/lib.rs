//! WireGuard gateway core library
//!
//! This crate holds everything the gateway reconciler computes without
//! touching the host: validated types, the peer registry, derived route
//! state, VRRP priority policy and the renderers for the three managed
//! daemons (WireGuard, BIRD, Keepalived).
//!
//! # Modules
//!
//! - [`types`]: Peer, policy and status types
//! - [`keys`]: X25519 key material in WireGuard encoding
//! - [`prefix`]: CIDR prefix sets
//! - [`registry`]: Known remote gateways
//! - [`route_state`]: Reachability derived from liveness observation
//! - [`priority`]: VRRP priority from reachable prefixes
//! - [`render`]: Target configuration documents
//! - [`error`]: Error types

pub mod error;
pub mod keys;
pub mod prefix;
pub mod priority;
pub mod registry;
pub mod render;
pub mod route_state;
pub mod types;

pub use error::{Error, Result};
pub use keys::{LocalIdentity, PrivateKey, WgKey};
pub use prefix::PrefixSet;
pub use registry::{PeerRegistry, UpsertOutcome};
pub use render::{render, RenderInput, RenderedConfig};
pub use route_state::{LivenessSnapshot, RouteState};
pub use types::*;
