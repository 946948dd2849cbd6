use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{error, info, warn};
use rtnetlink::Handle;

use super::{
    driver::NetworkDriver,
    endpoint::{Endpoint, VethPair},
    iptables::{self, Action, Iptables},
    link,
    network::Network,
};
use crate::core::error::Result;

pub const BRIDGE_DRIVER: &str = "bridge";

/// Linux bridge per network; containers hang off it through veth pairs.
#[derive(Debug, Default)]
pub struct BridgeDriver {
    iptables: Iptables,
}

#[async_trait]
impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &'static str {
        BRIDGE_DRIVER
    }

    async fn create(&self, subnet: Ipv4Net, name: &str) -> Result<Network> {
        let handle = link::connect()?;

        if let Err(e) = self.init_bridge(&handle, &subnet, name).await {
            error!("Failed to init bridge {name} for {subnet}: {e}");
            return Err(e);
        }

        Ok(Network::new(name, subnet, BRIDGE_DRIVER))
    }

    async fn delete(&self, network: &Network) -> Result<()> {
        let handle = link::connect()?;

        for rule in [
            iptables::masquerade_rule(Action::Delete, &network.ip_range, &network.name),
            iptables::forward_rule(Action::Delete, &network.name),
        ] {
            if let Err(e) = self.iptables.exec(&rule).await {
                warn!("Failed to remove rule of network {}: {e}", network.name);
            }
        }

        link::delete_link(&handle, &network.name).await
    }

    async fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()> {
        let handle = link::connect()?;
        let pair = VethPair::for_endpoint(&endpoint.id);

        link::create_veth_pair(&handle, &pair.host, &pair.peer).await?;
        endpoint.device = Some(pair.clone());

        link::set_controller(&handle, &pair.host, &network.name).await?;
        link::set_link_up(&handle, &pair.host).await
    }

    async fn disconnect(&self, _network: &Network, endpoint: &Endpoint) -> Result<()> {
        let Some(pair) = &endpoint.device else {
            return Ok(());
        };

        let handle = link::connect()?;
        match link::delete_link(&handle, &pair.host).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

impl BridgeDriver {
    pub fn new(iptables: Iptables) -> Self {
        Self { iptables }
    }

    async fn init_bridge(&self, handle: &Handle, subnet: &Ipv4Net, name: &str) -> Result<()> {
        if link::find_link(handle, name).await?.is_some() {
            info!("Bridge {name} already exists, reusing it");
            return self.set_up(handle, subnet, name, false).await;
        }

        link::create_bridge(handle, name).await?;

        if let Err(e) = self.set_up(handle, subnet, name, true).await {
            let _ = link::delete_link(handle, name).await;
            return Err(e);
        }

        Ok(())
    }

    async fn set_up(
        &self,
        handle: &Handle,
        subnet: &Ipv4Net,
        name: &str,
        assign_gateway: bool,
    ) -> Result<()> {
        if assign_gateway {
            link::add_address(handle, name, subnet.addr(), subnet.prefix_len()).await?;
        }
        link::set_link_up(handle, name).await?;

        // A reused bridge may still carry its rules.
        self.iptables
            .ensure(|action| iptables::masquerade_rule(action, subnet, name))
            .await?;
        self.iptables
            .ensure(|action| iptables::forward_rule(action, name))
            .await
    }
}
