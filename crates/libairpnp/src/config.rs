use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, bail};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};

/// The network identity the bridge binds everything to. Supplied by the CLI,
/// never persisted.
#[derive(Debug, Clone)]
pub struct Config {
    pub interface_name: String,
    pub interface_ip: Ipv4Addr,
    pub interface_index: u32,
}

/// Resolves an interface name (or, with `None`, the first non-loopback
/// interface with an IPv4 address) into a [`Config`].
pub fn resolve_interface(name: Option<&str>) -> anyhow::Result<Config> {
    let interfaces = NetworkInterface::show().context("error listing network interfaces")?;
    for nic in &interfaces {
        if let Some(name) = name
            && nic.name != name
        {
            continue;
        }
        let Some(ip) = nic.addr.iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        }) else {
            continue;
        };
        return Ok(Config {
            interface_name: nic.name.clone(),
            interface_ip: ip,
            interface_index: nic.index,
        });
    }
    match name {
        Some(name) => bail!("interface {name} not found or has no usable IPv4 address"),
        None => bail!("no usable network interface found"),
    }
}
