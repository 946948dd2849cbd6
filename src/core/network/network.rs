use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
};

use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tabwriter::TabWriter;

use super::{
    bridge::BridgeDriver,
    driver::{DynNetworkDriver, NetworkDriver},
    endpoint::{Endpoint, PortMapping},
    ipam::Ipam,
    iptables::{self, Action, Iptables},
    link, netns,
};
use crate::core::{
    container::ContainerInfo,
    error::{NetError, Result},
    store, StatePaths,
};

/// Linux refuses interface names longer than this.
const MAX_NAME_LEN: usize = 15;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Network {
    #[serde(rename = "Name")]
    pub name: String,
    /// The subnet, with the address part set to the gateway.
    #[serde(rename = "IPRange")]
    pub ip_range: Ipv4Net,
    #[serde(rename = "Driver")]
    pub driver: String,
}

impl Network {
    pub fn new(name: &str, ip_range: Ipv4Net, driver: &str) -> Self {
        Self {
            name: name.to_string(),
            ip_range,
            driver: driver.to_string(),
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.addr()
    }
}

/// Drivers and networks known to this process.
///
/// Rebuilt from the descriptor directory by [`Networks::init`]; the files
/// remain the source of truth and are re-read under the descriptor lock
/// before every create or delete.
pub struct Networks {
    paths: StatePaths,
    ipam: Ipam,
    iptables: Iptables,
    drivers: HashMap<String, DynNetworkDriver>,
    networks: BTreeMap<String, Network>,
}

impl Networks {
    pub fn init(paths: StatePaths) -> Result<Self> {
        Self::init_with_firewall(paths, Iptables::default())
    }

    /// Like [`Networks::init`], with every firewall rule going to `iptables`.
    pub fn init_with_firewall(paths: StatePaths, iptables: Iptables) -> Result<Self> {
        store::ensure_dir(&paths.network_dir)?;

        let mut networks = Self {
            ipam: Ipam::new(&paths.ipam_file, &paths.ipam_lock),
            paths,
            drivers: HashMap::new(),
            networks: BTreeMap::new(),
            iptables: iptables.clone(),
        };
        networks.register_driver(Arc::new(BridgeDriver::new(iptables)));
        networks.reload()?;

        Ok(networks)
    }

    /// Replaces any driver registered under the same name.
    pub fn register_driver(&mut self, driver: DynNetworkDriver) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Re-read every descriptor in the network directory.
    pub fn reload(&mut self) -> Result<()> {
        let dir = &self.paths.network_dir;
        let entries =
            fs::read_dir(dir).map_err(|e| NetError::persistence("failed to read directory", dir, e))?;

        let mut networks = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|e| NetError::persistence("failed to read directory", dir, e))?
                .path();
            if store::is_hidden(&path) || !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            match store::read_json::<Network>(&path) {
                Ok(Some(network)) => {
                    if network.name != name {
                        warn!(
                            "Descriptor {} names network {}, keeping it as {name}",
                            path.display(),
                            network.name
                        );
                    }
                    networks.insert(name, network);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping network descriptor {}: {e}", path.display()),
            }
        }

        debug!("Loaded {} network(s) from {}", networks.len(), dir.display());
        self.networks = networks;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    pub async fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<Network> {
        validate_name(name)?;
        let subnet: Ipv4Net = subnet
            .parse()
            .map_err(|_| NetError::invalid(format!("invalid subnet {subnet:?}")))?;
        let driver = self.driver(driver)?;

        let _lock = store::lock_exclusive(&self.paths.network_lock)?;
        self.reload()?;
        if self.networks.contains_key(name) {
            return Err(NetError::already_exists("network", name));
        }

        let gateway = self.ipam.allocate(&subnet).inspect_err(|e| {
            error!("Failed to allocate gateway of network {name} from {subnet}: {e}");
        })?;
        let ip_range = Ipv4Net::new(gateway, subnet.prefix_len())
            .map_err(|e| NetError::invalid(e.to_string()))?;

        let network = match driver.create(ip_range, name).await {
            Ok(network) => network,
            Err(e) => {
                error!("Failed to create network {name} on {subnet}, driver error: {e}");
                self.release_quietly(&ip_range, gateway);
                return Err(e);
            }
        };

        if let Err(e) = store::write_json(&self.descriptor_path(name), &network) {
            error!("Failed to save network {name}: {e}");
            if let Err(e) = driver.delete(&network).await {
                warn!("Failed to remove device of unsaved network {name}: {e}");
            }
            self.release_quietly(&ip_range, gateway);
            return Err(e);
        }

        info!("Network {name} created on {} with gateway {gateway}", ip_range.trunc());
        self.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    pub async fn delete_network(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if !self.networks.contains_key(name) && !self.descriptor_path(name).exists() {
            return Err(NetError::not_found("network", name));
        }

        let _lock = store::lock_exclusive(&self.paths.network_lock)?;
        self.reload()?;
        let network = self
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::not_found("network", name))?;

        match self.driver(&network.driver) {
            Ok(driver) => {
                if let Err(e) = driver.delete(&network).await {
                    warn!("Failed to remove device of network {name}: {e}");
                }
            }
            Err(e) => warn!("Cannot tear down network {name}: {e}"),
        }

        self.ipam.release(&network.ip_range, network.gateway())?;
        store::remove(&self.descriptor_path(name))?;
        self.networks.remove(name);

        info!("Network {name} removed");
        Ok(())
    }

    /// Render the known networks as a table.
    pub fn list_networks(&self) -> String {
        let mut tw = TabWriter::new(vec![]);
        let _ = tw.write_all(b"NAME\tIP RANGE\tDRIVER\n");

        for network in self.networks.values() {
            let _ = writeln!(tw, "{}\t{}\t{}", network.name, network.ip_range, network.driver);
        }

        let _ = tw.flush();
        tw.into_inner()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    /// Attach a running container to `network_name`.
    ///
    /// Allocation, link creation and in-namespace configuration are all or
    /// nothing: a failure removes the link and returns the address before the
    /// error propagates. Port publishing is best effort per entry.
    pub async fn connect(&self, network_name: &str, info: &ContainerInfo) -> Result<Endpoint> {
        let network = self
            .get(network_name)
            .ok_or_else(|| NetError::not_found("network", network_name))?;
        let driver = self.driver(&network.driver)?;

        let ip = self.ipam.allocate(&network.ip_range).inspect_err(|e| {
            error!(
                "Failed to allocate address for container {} on network {network_name}: {e}",
                info.name
            );
        })?;
        let mut endpoint = Endpoint::new(&info.id, network, ip, info.port_mapping.clone());

        if let Err(e) = attach(driver.as_ref(), network, &mut endpoint, info.pid).await {
            error!(
                "Failed to connect container {} to network {network_name}: {e}",
                info.name
            );
            self.rollback(driver.as_ref(), network, &endpoint).await;
            return Err(e);
        }

        publish_ports(&self.iptables, &mut endpoint).await;

        info!(
            "Container {} connected to network {network_name} as {ip}",
            info.name
        );
        Ok(endpoint)
    }

    /// Undo a successful [`Networks::connect`].
    pub async fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let network = self
            .get(&endpoint.network)
            .ok_or_else(|| NetError::not_found("network", &endpoint.network))?;
        let driver = self.driver(&network.driver)?;

        for mapping in &endpoint.published {
            let rule = iptables::dnat_rule(Action::Delete, mapping, endpoint.ip);
            if let Err(e) = self.iptables.exec(&rule).await {
                warn!("Failed to unpublish port {mapping} of {}: {e}", endpoint.id);
            }
        }

        driver.disconnect(network, endpoint).await?;
        self.ipam.release(&network.ip_range, endpoint.ip)?;

        info!("Endpoint {} disconnected from {}", endpoint.id, network.name);
        Ok(())
    }

    fn driver(&self, name: &str) -> Result<DynNetworkDriver> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::not_found("driver", name))
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.paths.network_dir.join(name)
    }

    async fn rollback(&self, driver: &dyn NetworkDriver, network: &Network, endpoint: &Endpoint) {
        if let Err(e) = driver.disconnect(network, endpoint).await {
            warn!("Failed to remove link of endpoint {}: {e}", endpoint.id);
        }
        self.release_quietly(&network.ip_range, endpoint.ip);
    }

    fn release_quietly(&self, subnet: &Ipv4Net, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            warn!("Failed to release {ip} back to {}: {e}", subnet.trunc());
        }
    }
}

async fn attach(
    driver: &dyn NetworkDriver,
    network: &Network,
    endpoint: &mut Endpoint,
    pid: i32,
) -> Result<()> {
    driver.connect(network, endpoint).await?;

    let peer = endpoint
        .device
        .as_ref()
        .map(|pair| pair.peer.clone())
        .ok_or_else(|| NetError::namespace("driver created no container-side link", None))?;

    let handle = link::connect()?;
    link::move_to_netns(&handle, &peer, pid).await?;

    let ip = endpoint.ip;
    let prefix_len = network.ip_range.prefix_len();
    let gateway = network.gateway();

    endpoint.mac = netns::run_in_netns(pid, move || {
        configure_container_link(peer, ip, prefix_len, gateway)
    })
    .await?;

    Ok(())
}

/// Runs inside the container's network namespace.
async fn configure_container_link(
    peer: String,
    ip: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
) -> Result<Option<String>> {
    let handle = link::connect()?;

    link::add_address(&handle, &peer, ip, prefix_len).await?;
    link::set_link_up(&handle, &peer).await?;
    link::set_link_up(&handle, "lo").await?;
    link::add_default_route(&handle, &peer, gateway).await?;

    Ok(link::find_link(&handle, &peer)
        .await?
        .as_ref()
        .and_then(link::mac_address))
}

async fn publish_ports(firewall: &Iptables, endpoint: &mut Endpoint) {
    let mut published = Vec::new();

    for entry in &endpoint.port_mapping {
        let mapping = match entry.parse::<PortMapping>() {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("Skipping port of endpoint {}: {e}", endpoint.id);
                continue;
            }
        };

        let rule = iptables::dnat_rule(Action::Append, &mapping, endpoint.ip);
        match firewall.exec(&rule).await {
            Ok(()) => published.push(mapping),
            Err(e) => error!("Failed to publish port {mapping} of endpoint {}: {e}", endpoint.id),
        }
    }

    endpoint.published = published;
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(NetError::invalid(format!(
            "network name {name:?} must be 1 to {MAX_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') || name.contains(['/', '\0']) || name.chars().any(char::is_whitespace) {
        return Err(NetError::invalid(format!("network name {name:?} is not allowed")));
    }

    Ok(())
}
