//! Host implementations driving `ip`, `wg`, `birdc`, `sysctl` and `systemctl`
//!
//! Command output is parsed by the free functions at the bottom of this
//! file so the parsing can be tested without the tools installed.

use super::{
    write_atomic, LiveInterface, RoutingControl, SubsystemError, VrrpControl, WireguardControl,
};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use wg_gateway_core::render::{LivePeer, WireguardConfig, WireguardPeer};
use wg_gateway_core::{Endpoint, WgKey};

/// Systemd unit of the VRRP daemon
const KEEPALIVED_SERVICE: &str = "keepalived";

/// Names of the OSPF protocols in the rendered BIRD config
const OSPF_PROTOCOLS: [&str; 2] = ["OSPF4", "OSPF6"];

/// Run a command, returning stdout on success
pub fn run(program: &str, args: &[&str]) -> Result<String, SubsystemError> {
    debug!("exec: {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(SubsystemError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn read_optional(path: &Path) -> Result<Option<String>, SubsystemError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// WIREGUARD
// =============================================================================

/// Kernel WireGuard via `ip` and `wg`
pub struct SystemWireguard {
    /// Private key file handed to `wg set`
    key_path: PathBuf,
}

impl SystemWireguard {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

impl WireguardControl for SystemWireguard {
    fn read(&mut self, interface: &str) -> Result<Option<LiveInterface>, SubsystemError> {
        let addr_json = match run("ip", &["-j", "addr", "show", "dev", interface]) {
            Ok(out) => out,
            Err(SubsystemError::CommandFailed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let (addresses, up) = parse_ip_addr_json(&addr_json)?;
        let dump = run("wg", &["show", interface, "dump"])?;
        let (public_key, listen_port, peers) = parse_wg_dump(&dump)?;

        Ok(Some(LiveInterface {
            public_key,
            listen_port,
            addresses,
            up,
            peers,
        }))
    }

    fn ensure_interface(&mut self, target: &WireguardConfig) -> Result<(), SubsystemError> {
        let ifname = target.interface.as_str();
        if run("ip", &["link", "show", "dev", ifname]).is_err() {
            run("ip", &["link", "add", "dev", ifname, "type", "wireguard"])?;
        }

        let key = format!("{}\n", target.private_key.to_base64());
        write_atomic(&self.key_path, key.as_bytes(), 0o600)?;
        let port = target.listen_port.to_string();
        let key_path = self.key_path.to_string_lossy().into_owned();
        run(
            "wg",
            &[
                "set",
                ifname,
                "listen-port",
                port.as_str(),
                "private-key",
                key_path.as_str(),
            ],
        )?;

        let address = target.address.to_string();
        run("ip", &["-6", "addr", "replace", address.as_str(), "dev", ifname])?;
        run("ip", &["link", "set", "up", "dev", ifname])?;
        Ok(())
    }

    fn set_peer(&mut self, interface: &str, peer: &WireguardPeer) -> Result<(), SubsystemError> {
        let key = peer.public_key.to_base64();
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
        let allowed = allowed.join(",");
        let keepalive = peer
            .persistent_keepalive
            .map(|k| k.to_string())
            .unwrap_or_else(|| "off".to_string());
        let endpoint = peer.endpoint.as_ref().map(|e| e.to_string());

        let mut args: Vec<&str> = vec![
            "set",
            interface,
            "peer",
            key.as_str(),
            "allowed-ips",
            allowed.as_str(),
            "persistent-keepalive",
            keepalive.as_str(),
        ];
        if let Some(endpoint) = &endpoint {
            args.push("endpoint");
            args.push(endpoint.as_str());
        }
        run("wg", &args)?;
        Ok(())
    }

    fn remove_peer(&mut self, interface: &str, key: &WgKey) -> Result<(), SubsystemError> {
        let key = key.to_base64();
        run("wg", &["set", interface, "peer", key.as_str(), "remove"])?;
        Ok(())
    }
}

// =============================================================================
// BIRD
// =============================================================================

/// BIRD 2 via its config file and `birdc`, plus kernel forwarding
pub struct SystemRouting {
    config_path: PathBuf,
    sysctl_path: PathBuf,
}

impl SystemRouting {
    pub fn new(config_path: impl Into<PathBuf>, sysctl_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            sysctl_path: sysctl_path.into(),
        }
    }
}

impl RoutingControl for SystemRouting {
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError> {
        read_optional(&self.config_path)
    }

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError> {
        write_atomic(&self.config_path, text.as_bytes(), 0o644)?;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), SubsystemError> {
        let out = run("birdc", &["configure"])?;
        check_birdc_configure(&out)
    }

    fn full_neighbors(&mut self) -> Result<BTreeSet<Ipv6Addr>, SubsystemError> {
        let out = run("birdc", &["show", "ospf", "neighbors"])?;
        Ok(parse_ospf_neighbors(&out))
    }

    fn learned_prefixes(&mut self) -> Result<BTreeSet<IpNet>, SubsystemError> {
        let mut prefixes = BTreeSet::new();
        for protocol in OSPF_PROTOCOLS {
            let out = run("birdc", &["show", "route", "protocol", protocol])?;
            prefixes.extend(parse_bird_routes(&out));
        }
        Ok(prefixes)
    }

    fn read_forwarding(&mut self) -> Result<Option<String>, SubsystemError> {
        read_optional(&self.sysctl_path)
    }

    fn write_forwarding(&mut self, text: &str) -> Result<(), SubsystemError> {
        write_atomic(&self.sysctl_path, text.as_bytes(), 0o644)?;
        Ok(())
    }

    fn load_sysctl(&mut self) -> Result<(), SubsystemError> {
        run("sysctl", &["--system"]).map(|_| ())
    }
}

// =============================================================================
// KEEPALIVED
// =============================================================================

/// Keepalived via its config file and systemd
pub struct SystemVrrp {
    config_path: PathBuf,
}

impl SystemVrrp {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }
}

impl VrrpControl for SystemVrrp {
    fn read_config(&mut self) -> Result<Option<String>, SubsystemError> {
        read_optional(&self.config_path)
    }

    fn write_config(&mut self, text: &str) -> Result<(), SubsystemError> {
        write_atomic(&self.config_path, text.as_bytes(), 0o644)?;
        Ok(())
    }

    fn is_running(&mut self) -> Result<bool, SubsystemError> {
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", KEEPALIVED_SERVICE])
            .status()?;
        Ok(status.success())
    }

    fn reload(&mut self) -> Result<(), SubsystemError> {
        run("systemctl", &["reload", KEEPALIVED_SERVICE])?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SubsystemError> {
        run("systemctl", &["start", KEEPALIVED_SERVICE])?;
        Ok(())
    }
}

// =============================================================================
// PARSERS
// =============================================================================

fn none_or(field: &str) -> Option<&str> {
    match field {
        "(none)" | "off" | "" => None,
        value => Some(value),
    }
}

fn parse_error(what: &str, value: &str) -> SubsystemError {
    SubsystemError::Parse(format!("{}: {:?}", what, value))
}

/// Parse `wg show <if> dump`: interface line, then one line per peer
pub fn parse_wg_dump(
    text: &str,
) -> Result<(Option<WgKey>, u16, Vec<LivePeer>), SubsystemError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| SubsystemError::Parse("empty wg dump".into()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(parse_error("wg interface line", header));
    }
    let public_key = none_or(fields[1])
        .map(WgKey::from_base64)
        .transpose()
        .map_err(|_| parse_error("interface public key", fields[1]))?;
    let listen_port = fields[2]
        .parse()
        .map_err(|_| parse_error("listen port", fields[2]))?;

    let mut peers = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(parse_error("wg peer line", line));
        }
        let public_key =
            WgKey::from_base64(fields[0]).map_err(|_| parse_error("peer public key", fields[0]))?;
        // Scoped link-local endpoints are not representable; treat as unknown
        let endpoint = none_or(fields[2]).and_then(|e| e.parse::<Endpoint>().ok());
        let mut allowed_ips = Vec::new();
        if let Some(list) = none_or(fields[3]) {
            for ip in list.split(',') {
                let ip: IpNet = ip
                    .trim()
                    .parse()
                    .map_err(|_| parse_error("allowed ip", ip))?;
                allowed_ips.push(ip);
            }
        }
        allowed_ips.sort();
        let latest_handshake = fields[4]
            .parse()
            .map_err(|_| parse_error("latest handshake", fields[4]))?;
        let persistent_keepalive = none_or(fields[7])
            .map(|k| k.parse::<u16>())
            .transpose()
            .map_err(|_| parse_error("persistent keepalive", fields[7]))?;

        peers.push(LivePeer {
            public_key,
            endpoint,
            allowed_ips,
            persistent_keepalive,
            latest_handshake,
        });
    }

    Ok((public_key, listen_port, peers))
}

#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: IpAddr,
    prefixlen: u8,
}

/// Parse `ip -j addr show dev <if>` into (addresses, admin up)
pub fn parse_ip_addr_json(text: &str) -> Result<(Vec<IpNet>, bool), SubsystemError> {
    let links: Vec<IpLink> =
        serde_json::from_str(text).map_err(|e| SubsystemError::Parse(e.to_string()))?;
    let Some(link) = links.into_iter().next() else {
        return Ok((Vec::new(), false));
    };
    let up = link.flags.iter().any(|f| f == "UP");
    let addresses = link
        .addr_info
        .iter()
        .filter_map(|a| IpNet::new(a.local, a.prefixlen).ok())
        .collect();
    Ok((addresses, up))
}

/// Router addresses of Full neighbors from `birdc show ospf neighbors`
pub fn parse_ospf_neighbors(text: &str) -> BTreeSet<Ipv6Addr> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || !fields[2].starts_with("Full") {
                return None;
            }
            fields.last()?.parse().ok()
        })
        .collect()
}

/// Destination prefixes from `birdc show route`
pub fn parse_bird_routes(text: &str) -> BTreeSet<IpNet> {
    text.lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

/// `birdc configure` exits zero even when the config is rejected
fn check_birdc_configure(output: &str) -> Result<(), SubsystemError> {
    let accepted = output.lines().any(|line| {
        let line = line.trim();
        line.starts_with("Reconfigured")
            || line.starts_with("Reconfiguration in progress")
            || line.starts_with("Reconfiguration already in progress")
    });
    if accepted {
        Ok(())
    } else {
        Err(SubsystemError::CommandFailed {
            command: "birdc configure".into(),
            status: 0,
            stderr: output.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> WgKey {
        WgKey([n; 32])
    }

    #[test]
    fn test_parse_wg_dump() {
        let dump = format!(
            "{}\t{}\t51820\toff\n\
             {}\t(none)\t172.16.0.2:51820\t10.0.2.0/24,fe80::2/128\t1700000000\t100\t200\t5\n\
             {}\t(none)\t(none)\t(none)\t0\t0\t0\toff\n",
            key(9).to_base64(),
            key(1).to_base64(),
            key(2).to_base64(),
            key(3).to_base64(),
        );
        let (public_key, port, peers) = parse_wg_dump(&dump).unwrap();
        assert_eq!(public_key, Some(key(1)));
        assert_eq!(port, 51820);
        assert_eq!(peers.len(), 2);

        assert_eq!(peers[0].public_key, key(2));
        assert_eq!(peers[0].endpoint.as_ref().unwrap().to_string(), "172.16.0.2:51820");
        assert_eq!(peers[0].allowed_ips.len(), 2);
        assert_eq!(peers[0].latest_handshake, 1_700_000_000);
        assert_eq!(peers[0].persistent_keepalive, Some(5));

        assert!(peers[1].endpoint.is_none());
        assert!(peers[1].allowed_ips.is_empty());
        assert_eq!(peers[1].persistent_keepalive, None);
    }

    #[test]
    fn test_parse_wg_dump_rejects_garbage() {
        assert!(parse_wg_dump("").is_err());
        assert!(parse_wg_dump("only-one-field").is_err());
    }

    #[test]
    fn test_parse_ip_addr_json() {
        let json = r#"[{"ifindex":7,"ifname":"wg0","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],
            "mtu":1420,"addr_info":[{"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"}]}]"#;
        let (addresses, up) = parse_ip_addr_json(json).unwrap();
        assert!(up);
        assert_eq!(addresses, vec!["fe80::1/64".parse::<IpNet>().unwrap()]);

        let down = r#"[{"ifname":"wg0","flags":["POINTOPOINT","NOARP"],"addr_info":[]}]"#;
        let (addresses, up) = parse_ip_addr_json(down).unwrap();
        assert!(!up);
        assert!(addresses.is_empty());
    }

    #[test]
    fn test_parse_ospf_neighbors() {
        let out = "BIRD 2.0.8 ready.\n\
                   OSPF6:\n\
                   Router ID   \tPri\t     State     \tDTime\tInterface  Router IP\n\
                   172.16.0.11 \t  1\tFull/PtP  \t31.783\twg0        fe80::2\n\
                   172.16.0.12 \t  1\tInit/PtP  \t28.100\twg0        fe80::3\n\
                   OSPF4:\n\
                   Router ID   \tPri\t     State     \tDTime\tInterface  Router IP\n\
                   172.16.0.11 \t  1\tFull/PtP  \t31.783\twg0        fe80::2\n";
        let neighbors = parse_ospf_neighbors(out);
        assert_eq!(neighbors.len(), 1);
        assert!(neighbors.contains(&"fe80::2".parse().unwrap()));
    }

    #[test]
    fn test_parse_bird_routes() {
        let out = "BIRD 2.0.8 ready.\n\
                   Table master4:\n\
                   10.0.2.0/24          unicast [OSPF4 10:14:22.123] * I (150/20) [172.16.0.11]\n\
                   \tvia fe80::2 on wg0\n\
                   192.0.2.0/24         unicast [OSPF4 10:14:22.123] * E2 (150/10/10000) [172.16.0.11]\n\
                   \tvia fe80::2 on wg0\n";
        let routes = parse_bird_routes(out);
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&"10.0.2.0/24".parse().unwrap()));
    }

    #[test]
    fn test_birdc_configure_check() {
        let header = "BIRD 2.0.8 ready.\nReading configuration from /etc/bird/bird.conf\n";
        assert!(check_birdc_configure(&format!("{}Reconfigured\n", header)).is_ok());
        let broken = format!("{}/etc/bird/bird.conf:12:3 syntax error\n", header);
        assert!(check_birdc_configure(&broken).is_err());
    }
}
