//! Uplink detection
//!
//! When the operator leaves router id or VRRP interface unset, both are
//! taken from the route the host would use towards the internet.

use crate::subsystem::system::run;
use crate::subsystem::SubsystemError;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Any public address works; only the route lookup matters
const ROUTE_LOOKUP_DESTINATION: &str = "1.2.3.4";

/// Default-route source address and device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub router_id: Ipv4Addr,
    pub interface: String,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    dev: String,
    prefsrc: Option<Ipv4Addr>,
}

/// Parse `ip -4 -j route get <dst>`
pub fn parse_route_get(json: &str) -> Result<Uplink, SubsystemError> {
    let routes: Vec<RouteEntry> =
        serde_json::from_str(json).map_err(|e| SubsystemError::Parse(e.to_string()))?;
    let route = routes
        .into_iter()
        .next()
        .ok_or_else(|| SubsystemError::Parse("no route to lookup destination".into()))?;
    let router_id = route
        .prefsrc
        .ok_or_else(|| SubsystemError::Parse("route has no preferred source".into()))?;
    Ok(Uplink {
        router_id,
        interface: route.dev,
    })
}

/// Ask the kernel which source address and device it would use
pub fn detect_uplink() -> Result<Uplink, SubsystemError> {
    let out = run("ip", &["-4", "-j", "route", "get", ROUTE_LOOKUP_DESTINATION])?;
    parse_route_get(&out)
}
