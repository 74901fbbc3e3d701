use crate::error::{self, Result};
use crate::exec::{Cmd, CommandRunner};
use e2e_model::constants::{NODE_IP_PROBE_TARGET, VIRTUAL_INTERFACE_PREFIXES};
use e2e_model::Settings;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr};

/// Determines the address the node should use: the configured override, else the source address
/// of the default route, else the first private address of a physical interface that is up.
pub async fn resolve_node_address<R>(settings: &Settings, runner: &R) -> Result<IpAddr>
where
    R: CommandRunner,
{
    if let Some(ip) = settings.node_ip {
        info!("Using configured node IP {}", ip);
        return Ok(ip);
    }

    let route = runner
        .output(&Cmd::new("ip").args(["-4", "route", "get", NODE_IP_PROBE_TARGET]))
        .await;
    match route {
        Ok(output) if output.success() => {
            if let Some(ip) = parse_route_source(&output.stdout) {
                info!("Detected node IP {} from the default route", ip);
                return Ok(IpAddr::V4(ip));
            }
        }
        Ok(output) => debug!("'ip route get' exited with {:?}", output.code),
        Err(e) => debug!("'ip route get' failed: {}", e),
    }

    let addresses = runner
        .output(&Cmd::new("ip").args(["-4", "-o", "addr", "show", "up"]))
        .await;
    if let Ok(output) = addresses {
        if let Some(ip) = first_private_address(&output.stdout) {
            info!("Detected node IP {} from the interface list", ip);
            return Ok(IpAddr::V4(ip));
        }
    }

    error::AddressUnresolvableSnafu.fail()
}

/// Extracts the `src` address from `ip route get` output, e.g.
/// `1.1.1.1 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 1000`.
pub fn parse_route_source(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "src" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

/// Parses `ip -4 -o addr show up` output into interface names and addresses, e.g.
/// `2: eth0    inet 192.168.1.20/24 brd 192.168.1.255 scope global eth0`.
pub fn parse_interface_addresses(output: &str) -> Vec<(String, Ipv4Addr)> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let _index = tokens.next()?;
            let interface = tokens.next()?.trim_end_matches(':');
            let _family = tokens.next().filter(|family| *family == "inet")?;
            let cidr = tokens.next()?;
            let address = cidr.split('/').next()?.parse().ok()?;
            Some((interface.to_string(), address))
        })
        .collect()
}

/// Loopback, container bridges and overlay networks never carry the node address.
pub fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

pub fn first_private_address(output: &str) -> Option<Ipv4Addr> {
    parse_interface_addresses(output)
        .into_iter()
        .find(|(interface, address)| !is_virtual_interface(interface) && address.is_private())
        .map(|(_, address)| address)
}
