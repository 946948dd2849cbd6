use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{endpoint::Endpoint, network::Network};
use crate::core::error::Result;

/// Shared driver trait object.
pub type DynNetworkDriver = Arc<dyn NetworkDriver>;

/// A kind of virtual network.
///
/// Callers allocate addresses before invoking a driver; drivers only touch
/// host-side kernel state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Name the driver is registered under.
    fn name(&self) -> &'static str;

    /// Provision the device for a network. `subnet` carries the gateway
    /// address and the prefix length.
    async fn create(&self, subnet: Ipv4Net, name: &str) -> Result<Network>;

    async fn delete(&self, network: &Network) -> Result<()>;

    /// Create the endpoint's link and attach it to the network. Fills in
    /// `endpoint.device`.
    async fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()>;

    async fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}
