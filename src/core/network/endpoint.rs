use std::{fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::core::error::NetError;

use super::network::Network;

/// Prefix of the container-side end of a veth pair.
pub const PEER_PREFIX: &str = "cif-";
const VETH_STEM_LEN: usize = 5;

/// A container's attachment to one network.
///
/// Endpoints are not persisted on their own; the container record that owns
/// one keeps it so that a later `stop` or `rm` can undo the attachment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub device: Option<VethPair>,
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub port_mapping: Vec<String>,
    /// Mappings that made it into the firewall.
    pub published: Vec<PortMapping>,
    /// Name of the owning network.
    pub network: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: String,
    pub peer: String,
}

impl Endpoint {
    pub fn new(container_id: &str, network: &Network, ip: Ipv4Addr, port_mapping: Vec<String>) -> Self {
        Self {
            id: format!("{}-{}", container_id, network.name),
            device: None,
            ip,
            mac: None,
            port_mapping,
            published: Vec::new(),
            network: network.name.clone(),
        }
    }
}

impl VethPair {
    /// Both names derive from the first characters of the endpoint id.
    pub fn for_endpoint(endpoint_id: &str) -> Self {
        let stem: String = endpoint_id.chars().take(VETH_STEM_LEN).collect();

        Self {
            peer: format!("{PEER_PREFIX}{stem}"),
            host: stem,
        }
    }
}

/// A published port, `hostPort:containerPort`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || NetError::MalformedPortMapping {
            mapping: s.to_string(),
        };

        let (host, container) = s.split_once(':').ok_or_else(malformed)?;
        let parse = |port: &str| {
            port.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(malformed)
        };

        Ok(Self {
            host: parse(host)?,
            container: parse(container)?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("8080:80", 8080, 80)]
    #[case("443:8443", 443, 8443)]
    #[case(" 53 : 53 ", 53, 53)]
    fn test_parse_port_mapping(#[case] input: &str, #[case] host: u16, #[case] container: u16) {
        assert_eq!(input.parse::<PortMapping>().unwrap(), PortMapping { host, container });
    }

    #[rstest]
    #[case("8080")]
    #[case("8080:80:90")]
    #[case(":80")]
    #[case("8080:")]
    #[case("http:80")]
    #[case("0:80")]
    #[case("70000:80")]
    fn test_parse_port_mapping_malformed(#[case] input: &str) {
        let err = input.parse::<PortMapping>().unwrap_err();
        assert!(matches!(err, NetError::MalformedPortMapping { mapping } if mapping == input));
    }

    #[test]
    fn test_veth_names() {
        let pair = VethPair::for_endpoint("c1-net1");
        assert_eq!(pair.host, "c1-ne");
        assert_eq!(pair.peer, "cif-c1-ne");

        let short = VethPair::for_endpoint("ab");
        assert_eq!(short.host, "ab");
        assert_eq!(short.peer, "cif-ab");
    }

    #[test]
    fn test_endpoint_id() {
        let network = Network::new("net1", "192.168.0.1/24".parse().unwrap(), "bridge");
        let endpoint = Endpoint::new("c1", &network, Ipv4Addr::new(192, 168, 0, 2), vec![]);

        assert_eq!(endpoint.id, "c1-net1");
        assert_eq!(endpoint.network, "net1");
        assert!(endpoint.device.is_none());
    }
}
