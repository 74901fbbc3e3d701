use std::fmt::{Display, Formatter};
use std::net::IpAddr;

/// The launch configuration version understood by the MicroK8s snap.
pub const NETWORK_CONFIG_VERSION: &str = "0.1.0";

/// The kubelet address types the API server prefers when it talks to nodes.
const PREFERRED_ADDRESS_TYPES: &str = "InternalIP,Hostname,InternalDNS,ExternalDNS,ExternalIP";

/// The desired MicroK8s launch configuration. Both the kubelet and the API server are pinned to
/// the node address so that kubelet serving certificates carry an address the API server uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    node_ip: IpAddr,
}

impl NetworkConfig {
    pub fn new(node_ip: IpAddr) -> Self {
        Self { node_ip }
    }

    pub fn node_ip(&self) -> IpAddr {
        self.node_ip
    }

    /// Renders the configuration as the YAML document accepted by `snap set microk8s config=`.
    pub fn render(&self) -> String {
        format!(
            r#"version: {version}
extraKubeletArgs:
  --node-ip: {ip}
  --rotate-server-certificates: "true"
extraKubeAPIServerArgs:
  --advertise-address: {ip}
  --kubelet-preferred-address-types: {address_types}
"#,
            version = NETWORK_CONFIG_VERSION,
            ip = self.node_ip,
            address_types = PREFERRED_ADDRESS_TYPES,
        )
    }

    /// Returns `true` when the configuration read back from the snap is equivalent to this one.
    pub fn is_applied(&self, observed: &str) -> bool {
        normalize(observed) == normalize(&self.render())
    }
}

impl Display for NetworkConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Canonical form of a launch configuration. Every line is trimmed and blank lines are dropped.
/// Indented lines belong to the closest preceding top-level line; both the top-level entries and
/// the entries nested under each of them are sorted, so ordering differences do not matter while
/// an argument moved to another section still does.
pub fn normalize(text: &str) -> String {
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        match sections.last_mut() {
            Some((_, children)) if indented => children.push(trimmed.to_string()),
            _ => sections.push((trimmed.to_string(), Vec::new())),
        }
    }
    for (_, children) in sections.iter_mut() {
        children.sort();
    }
    sections.sort();

    let mut normalized = String::new();
    for (parent, children) in sections {
        normalized.push_str(&parent);
        normalized.push('\n');
        for child in children {
            normalized.push_str("  ");
            normalized.push_str(&child);
            normalized.push('\n');
        }
    }
    normalized
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn config() -> NetworkConfig {
        NetworkConfig::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
    }

    #[test]
    fn render_pins_node_ip() {
        let rendered = config().render();
        assert!(rendered.starts_with("version: 0.1.0\n"));
        assert!(rendered.contains("  --node-ip: 192.168.1.20\n"));
        assert!(rendered.contains("  --advertise-address: 192.168.1.20\n"));
        assert!(rendered.contains("  --rotate-server-certificates: \"true\"\n"));
    }

    #[test]
    fn applied_ignores_whitespace_and_order() {
        let observed = r#"
extraKubeAPIServerArgs:
    --kubelet-preferred-address-types: InternalIP,Hostname,InternalDNS,ExternalDNS,ExternalIP
    --advertise-address: 192.168.1.20

version: 0.1.0
extraKubeletArgs:
    --rotate-server-certificates: "true"
    --node-ip: 192.168.1.20   
"#;
        assert!(config().is_applied(observed));
        assert!(config().is_applied(&config().render()));
    }

    #[test]
    fn not_applied_when_address_differs() {
        let other = NetworkConfig::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)));
        assert!(!config().is_applied(&other.render()));
        assert!(!config().is_applied(""));
    }

    #[test]
    fn not_applied_when_argument_changes_section() {
        let observed = config()
            .render()
            .replace("  --rotate-server-certificates: \"true\"\n", "")
            .replace(
                "extraKubeAPIServerArgs:\n",
                "extraKubeAPIServerArgs:\n  --rotate-server-certificates: \"true\"\n",
            );
        assert!(!config().is_applied(&observed));
    }
}
