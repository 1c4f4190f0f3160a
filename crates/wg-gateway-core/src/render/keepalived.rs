//! Keepalived VRRP document

use crate::types::LocalConfig;
use ipnet::IpNet;

/// Keepalived target with the priority it was rendered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivedConfig {
    pub priority: u8,
    pub text: String,
}

fn vrrp_instance(
    lines: &mut Vec<String>,
    name: &str,
    config: &LocalConfig,
    priority: u8,
    vips: &[&IpNet],
) {
    let vrrp = &config.vrrp;
    lines.push(String::new());
    lines.push(format!("vrrp_instance {} {{", name));
    lines.push("  state BACKUP".to_string());
    lines.push(format!("  interface {}", vrrp.interface));
    lines.push(format!("  virtual_router_id {}", vrrp.virtual_router_id));
    lines.push(format!("  priority {}", priority));
    lines.push(format!("  advert_int {}", vrrp.advert_int));
    lines.push(String::new());
    lines.push("  virtual_ipaddress {".to_string());
    for vip in vips {
        lines.push(format!("    {} dev {}", vip, vrrp.interface));
    }
    lines.push("  }".to_string());
    lines.push("}".to_string());
}

/// Render `keepalived.conf` for a computed priority. Without virtual
/// addresses only the global section is emitted.
pub fn render(config: &LocalConfig, priority: u8) -> KeepalivedConfig {
    let mut vips: Vec<&IpNet> = config.vrrp.vips.iter().collect();
    vips.sort();
    vips.dedup();
    let v4: Vec<&IpNet> = vips.iter().copied().filter(|v| matches!(v, IpNet::V4(_))).collect();
    let v6: Vec<&IpNet> = vips.iter().copied().filter(|v| matches!(v, IpNet::V6(_))).collect();

    let mut lines = vec![
        "global_defs {".to_string(),
        format!("  router_id {}", config.router_id),
        "}".to_string(),
    ];

    let mut instances = Vec::new();
    if !v4.is_empty() {
        vrrp_instance(&mut lines, "vrrp_v4", config, priority, &v4);
        instances.push("vrrp_v4");
    }
    if !v6.is_empty() {
        vrrp_instance(&mut lines, "vrrp_v6", config, priority, &v6);
        instances.push("vrrp_v6");
    }

    // Both families fail over together
    if instances.len() > 1 {
        lines.push(String::new());
        lines.push("vrrp_sync_group vrrp_group {".to_string());
        lines.push("  group {".to_string());
        for name in &instances {
            lines.push(format!("    {}", name));
        }
        lines.push("  }".to_string());
        lines.push("}".to_string());
    }
    lines.push(String::new());

    KeepalivedConfig {
        priority,
        text: lines.join("\n"),
    }
}
