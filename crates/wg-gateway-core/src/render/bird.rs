//! BIRD 2 routing document
//!
//! Two OSPFv3 instances (RFC 5838 address families) run over the tunnel
//! interface in point-to-multipoint mode with explicit neighbors, since
//! WireGuard carries no multicast. Local prefixes are redistributed as
//! stub networks; kernel protocols export with ECMP merge.

use crate::types::LocalConfig;
use ipnet::IpNet;
use std::net::Ipv6Addr;

/// Upper bound on ECMP next hops
const ECMP_LIMIT: u8 = 64;

fn kernel_protocol(lines: &mut Vec<String>, name: &str, channel: &str) {
    lines.push(format!("protocol kernel {} {{", name));
    lines.push(format!("  {} {{ import none; export all; }};", channel));
    lines.push(format!("  merge paths yes limit {};", ECMP_LIMIT));
    lines.push("}".to_string());
    lines.push(String::new());
}

fn ospf_protocol<'a>(
    lines: &mut Vec<String>,
    name: &str,
    instance_id: u8,
    channel: &str,
    config: &LocalConfig,
    neighbors: &[Ipv6Addr],
    stubnets: impl Iterator<Item = &'a IpNet>,
) {
    let ospf = &config.ospf;
    lines.push(format!("protocol ospf v3 {} {{", name));
    lines.push("  rfc5838 yes;".to_string());
    lines.push(format!("  ecmp yes limit {};", ECMP_LIMIT));
    lines.push(format!("  instance id {};", instance_id));
    lines.push(format!("  {} {{ import all; export none; }};", channel));

    // No tunnels, no area: the daemon keeps running idle
    if !neighbors.is_empty() {
        lines.push(String::new());
        lines.push(format!("  area {} {{", ospf.area));
        lines.push(format!("    interface \"{}\" {{", config.interface));
        lines.push(format!(
            "      type ptmp; cost {}; hello {}; dead {};",
            ospf.cost, ospf.hello, ospf.dead
        ));
        lines.push("      neighbors {".to_string());
        for neighbor in neighbors {
            lines.push(format!("        {};", neighbor));
        }
        lines.push("      };".to_string());
        lines.push("    };".to_string());
        for prefix in stubnets {
            lines.push(format!("    stubnet {} {{ cost {}; }};", prefix, ospf.cost));
        }
        lines.push("  };".to_string());
    }
    lines.push("}".to_string());
}

/// Kernel forwarding the routed tunnel depends on, as a sysctl.d drop-in
pub fn forwarding_sysctl() -> String {
    ["net.ipv4.ip_forward = 1", "net.ipv6.conf.all.forwarding = 1", ""].join("\n")
}

/// Render `bird.conf`. `neighbors` must already be sorted and unique.
pub fn render(config: &LocalConfig, neighbors: &[Ipv6Addr]) -> String {
    let mut lines = vec![format!("router id {};", config.router_id), String::new()];
    kernel_protocol(&mut lines, "k4", "ipv4");
    kernel_protocol(&mut lines, "k6", "ipv6");
    lines.push("protocol device {}".to_string());
    lines.push(String::new());

    ospf_protocol(
        &mut lines,
        "OSPF6",
        0,
        "ipv6",
        config,
        neighbors,
        config.advertise_prefixes.ipv6(),
    );
    lines.push(String::new());
    ospf_protocol(
        &mut lines,
        "OSPF4",
        64,
        "ipv4",
        config,
        neighbors,
        config.advertise_prefixes.ipv4(),
    );
    lines.push(String::new());
    lines.join("\n")
}
