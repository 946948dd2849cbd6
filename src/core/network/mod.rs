mod bridge;
pub mod driver;
mod endpoint;
mod ipam;
mod iptables;
mod link;
mod netns;
mod network;

pub use bridge::{BridgeDriver, BRIDGE_DRIVER};
pub use driver::{DynNetworkDriver, NetworkDriver};
pub use endpoint::{Endpoint, PortMapping, VethPair, PEER_PREFIX};
pub use ipam::{Ipam, SubnetTable, MIN_PREFIX_LEN};
pub use iptables::Iptables;
pub use netns::{run_in_netns, NetnsGuard};
pub use network::{Network, Networks};

/// Subnet used by `network create` when none is given.
pub const DEFAULT_SUBNET: &str = "192.168.0.1/24";
