//! Configuration for gatewayd

use crate::network::Uplink;
use anyhow::Context;
use clap::Parser;
use ipnet::{IpNet, Ipv6Net};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use wg_gateway_core::priority::PriorityPolicy;
use wg_gateway_core::{host_route, LocalConfig, OspfPolicy, PrefixSet, VrrpPolicy, WgKey};

/// gatewayd - WireGuard/OSPF/VRRP gateway reconciler
#[derive(Parser, Debug, Clone)]
#[command(name = "gatewayd")]
#[command(about = "WireGuard/OSPF/VRRP site-to-site gateway reconciler")]
pub struct Config {
    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/gatewayd")]
    pub data_dir: PathBuf,

    /// WireGuard interface name
    #[arg(long, default_value = "wg0")]
    pub interface: String,

    /// WireGuard UDP listen port
    #[arg(long, default_value = "51820")]
    pub listen_port: u16,

    /// Local tunnel address (default: fe80::/64 link-local derived from the public key)
    #[arg(long)]
    pub tunnel_address: Option<Ipv6Net>,

    /// Prefixes this gateway reaches directly (comma-separated CIDR)
    #[arg(long, env = "GATEWAY_ADVERTISE_PREFIXES", default_value = "")]
    pub advertise_prefixes: String,

    /// Virtual addresses managed by VRRP (comma-separated address/len)
    #[arg(long, value_delimiter = ',')]
    pub vips: Vec<String>,

    /// OSPF and VRRP router id (default: uplink source address)
    #[arg(long)]
    pub router_id: Option<Ipv4Addr>,

    /// Interface carrying the virtual addresses (default: uplink device)
    #[arg(long)]
    pub vrrp_interface: Option<String>,

    /// VRRP virtual router id
    #[arg(long, default_value = "1")]
    pub virtual_router_id: u8,

    /// OSPF area
    #[arg(long, default_value = "0.0.0.0")]
    pub ospf_area: Ipv4Addr,

    /// OSPF interface cost
    #[arg(long, default_value = "10")]
    pub ospf_cost: u16,

    /// OSPF hello interval in seconds
    #[arg(long, default_value = "5")]
    pub ospf_hello: u16,

    /// OSPF dead interval in seconds
    #[arg(long, default_value = "30")]
    pub ospf_dead: u16,

    /// VRRP priority with at least one reachable prefix
    #[arg(long, default_value = "100")]
    pub priority_base: u8,

    /// VRRP priority added per reachable prefix
    #[arg(long, default_value = "10")]
    pub priority_per_prefix: u8,

    /// VRRP priority with no reachable prefixes
    #[arg(long, default_value = "1")]
    pub priority_min: u8,

    /// VRRP priority ceiling
    #[arg(long, default_value = "254")]
    pub priority_max: u8,

    /// WireGuard persistent keepalive in seconds (0 disables)
    #[arg(long, default_value = "5")]
    pub persistent_keepalive: u16,

    /// Health tick interval in seconds
    #[arg(long, default_value = "30")]
    pub tick_interval_secs: u64,

    /// Relation snapshot file (JSON array of relation records)
    #[arg(long, env = "GATEWAY_PEERS_FILE")]
    pub peers_file: Option<PathBuf>,

    /// Relation snapshot poll interval in seconds
    #[arg(long, default_value = "5")]
    pub relation_poll_secs: u64,

    /// Directory for advertisement.json and status.json
    #[arg(long)]
    pub status_dir: Option<PathBuf>,

    /// BIRD configuration file
    #[arg(long, default_value = "/etc/bird/bird.conf")]
    pub bird_config: PathBuf,

    /// Keepalived configuration file
    #[arg(long, default_value = "/etc/keepalived/keepalived.conf")]
    pub keepalived_config: PathBuf,

    /// sysctl.d drop-in enabling IP forwarding
    #[arg(long, default_value = "/etc/sysctl.d/99-wireguard-gateway.conf")]
    pub sysctl_config: PathBuf,

    /// Runtime settings file (JSON), re-read on SIGHUP
    #[arg(long, env = "GATEWAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Log commands instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Replace the persisted WireGuard key pair before the first pass
    #[arg(long)]
    pub regenerate_key: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

/// Operator settings that can change without a restart. Absent fields
/// keep the command-line value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuntimeSettings {
    pub advertise_prefixes: Option<Vec<String>>,
    pub vips: Option<Vec<String>>,
    pub persistent_keepalive: Option<u16>,
    pub ospf_cost: Option<u16>,
    pub ospf_hello: Option<u16>,
    pub ospf_dead: Option<u16>,
    pub priority_base: Option<u8>,
    pub priority_per_prefix: Option<u8>,
    pub priority_min: Option<u8>,
    pub priority_max: Option<u8>,
}

impl RuntimeSettings {
    /// Read a settings file. A missing file carries no overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn overlay(self, config: &mut Config) {
        if let Some(prefixes) = self.advertise_prefixes {
            config.advertise_prefixes = prefixes.join(",");
        }
        if let Some(vips) = self.vips {
            config.vips = vips;
        }
        let numbers = [
            (self.persistent_keepalive, &mut config.persistent_keepalive),
            (self.ospf_cost, &mut config.ospf_cost),
            (self.ospf_hello, &mut config.ospf_hello),
            (self.ospf_dead, &mut config.ospf_dead),
        ];
        for (value, slot) in numbers {
            if let Some(value) = value {
                *slot = value;
            }
        }
        let priorities = [
            (self.priority_base, &mut config.priority_base),
            (self.priority_per_prefix, &mut config.priority_per_prefix),
            (self.priority_min, &mut config.priority_min),
            (self.priority_max, &mut config.priority_max),
        ];
        for (value, slot) in priorities {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// Parse a VIP, keeping host bits. A bare address is a host route.
fn parse_vip(value: &str) -> anyhow::Result<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    match value.parse::<IpAddr>() {
        Ok(addr) => Ok(host_route(addr)),
        Err(_) => anyhow::bail!("Invalid virtual address {:?}", value),
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_secs == 0 || self.relation_poll_secs == 0 {
            anyhow::bail!("Intervals must be non-zero");
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            anyhow::bail!("Log format must be json or pretty");
        }
        PrefixSet::parse_list(&self.advertise_prefixes)?;
        for vip in self.vips.iter().filter(|v| !v.trim().is_empty()) {
            parse_vip(vip)?;
        }
        self.priority_policy().validate()?;
        Ok(())
    }

    /// Whether uplink detection is needed to build the local config
    pub fn needs_uplink(&self) -> bool {
        self.router_id.is_none() || self.vrrp_interface.is_none()
    }

    pub fn priority_policy(&self) -> PriorityPolicy {
        PriorityPolicy {
            base: self.priority_base,
            per_prefix: self.priority_per_prefix,
            min: self.priority_min,
            max: self.priority_max,
        }
    }

    pub fn status_dir(&self) -> PathBuf {
        self.status_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("status"))
    }

    /// This configuration with the runtime settings file laid over it
    pub fn with_settings_file(&self) -> anyhow::Result<Config> {
        let mut config = self.clone();
        if let Some(path) = &self.config_file {
            RuntimeSettings::load(path)?.overlay(&mut config);
            config.validate()?;
        }
        Ok(config)
    }

    /// Build the validated per-pass configuration
    pub fn to_local_config(
        &self,
        uplink: Option<&Uplink>,
        public_key: &WgKey,
    ) -> anyhow::Result<LocalConfig> {
        let router_id = match (self.router_id, uplink) {
            (Some(id), _) => id,
            (None, Some(uplink)) => uplink.router_id,
            (None, None) => anyhow::bail!("No --router-id and no uplink detected"),
        };
        let vrrp_interface = match (&self.vrrp_interface, uplink) {
            (Some(ifname), _) => ifname.clone(),
            (None, Some(uplink)) => uplink.interface.clone(),
            (None, None) => anyhow::bail!("No --vrrp-interface and no uplink detected"),
        };

        let mut vips = self
            .vips
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_vip(v))
            .collect::<anyhow::Result<Vec<_>>>()?;
        vips.sort();
        vips.dedup();

        let config = LocalConfig {
            interface: self.interface.clone(),
            listen_port: self.listen_port,
            tunnel_address: self
                .tunnel_address
                .unwrap_or_else(|| public_key.link_local()),
            advertise_prefixes: PrefixSet::parse_list(&self.advertise_prefixes)?,
            persistent_keepalive: self.persistent_keepalive,
            router_id,
            ospf: OspfPolicy {
                area: self.ospf_area,
                cost: self.ospf_cost,
                hello: self.ospf_hello,
                dead: self.ospf_dead,
            },
            vrrp: VrrpPolicy {
                interface: vrrp_interface,
                virtual_router_id: self.virtual_router_id,
                advert_int: 1,
                vips,
                priority: self.priority_policy(),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
