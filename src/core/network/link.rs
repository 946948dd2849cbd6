//! Thin wrappers over rtnetlink requests.
//!
//! A [`Handle`] is bound to the network namespace of the thread that opened
//! it, so code running inside a container namespace must call [`connect`]
//! after switching.

use std::{
    net::{IpAddr, Ipv4Addr},
    num::NonZeroI32,
    os::fd::{AsFd, AsRawFd},
};

use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use nix::libc::ENODEV;
use netlink_packet_core::ErrorMessage;
use rtnetlink::Handle;

use crate::core::error::{NetError, Result};

pub fn connect() -> Result<Handle> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| NetError::link("failed to open netlink socket", e))?;
    tokio::spawn(connection);

    Ok(handle)
}

/// Look a link up by name, `None` if no such device exists.
pub async fn find_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute();

    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(msg)) if is_no_device(&msg) => Ok(None),
        Err(e) => Err(NetError::link(format!("failed to look up link {name}"), e)),
    }
}

/// The kernel answers a lookup of an unknown name with ENODEV.
fn is_no_device(msg: &ErrorMessage) -> bool {
    msg.code.map(NonZeroI32::get) == Some(-ENODEV)
}

pub async fn get_link_by_name(handle: &Handle, name: &str) -> Result<LinkMessage> {
    find_link(handle, name)
        .await?
        .ok_or_else(|| NetError::not_found("link", name))
}

pub async fn create_bridge(handle: &Handle, name: &str) -> Result<()> {
    handle
        .link()
        .add()
        .bridge(name.to_string())
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to create bridge {name}"), e))
}

pub async fn create_veth_pair(handle: &Handle, host: &str, peer: &str) -> Result<()> {
    handle
        .link()
        .add()
        .veth(host.to_string(), peer.to_string())
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to create veth pair {host}/{peer}"), e))
}

pub async fn delete_link(handle: &Handle, name: &str) -> Result<()> {
    let link = get_link_by_name(handle, name).await?;

    handle
        .link()
        .del(link.header.index)
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to delete link {name}"), e))
}

pub async fn set_controller(handle: &Handle, iface: &str, bridge: &str) -> Result<()> {
    let bridge_link = get_link_by_name(handle, bridge).await?;
    let iface_link = get_link_by_name(handle, iface).await?;

    handle
        .link()
        .set(iface_link.header.index)
        .controller(bridge_link.header.index)
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to attach {iface} to {bridge}"), e))
}

pub async fn set_link_up(handle: &Handle, name: &str) -> Result<()> {
    let link = get_link_by_name(handle, name).await?;

    handle
        .link()
        .set(link.header.index)
        .up()
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to set {name} up"), e))
}

pub async fn add_address(handle: &Handle, name: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let link = get_link_by_name(handle, name).await?;

    handle
        .address()
        .add(link.header.index, IpAddr::V4(ip), prefix_len)
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to assign {ip}/{prefix_len} to {name}"), e))
}

pub async fn add_default_route(handle: &Handle, name: &str, gateway: Ipv4Addr) -> Result<()> {
    let link = get_link_by_name(handle, name).await?;

    handle
        .route()
        .add()
        .v4()
        .output_interface(link.header.index)
        .gateway(gateway)
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to add default route via {gateway}"), e))
}

/// Move `name` into the network namespace of process `pid`.
pub async fn move_to_netns(handle: &Handle, name: &str, pid: i32) -> Result<()> {
    let link = get_link_by_name(handle, name).await?;

    let netns_path = format!("/proc/{pid}/ns/net");
    let netns_file = tokio::fs::File::open(&netns_path).await.map_err(|e| {
        NetError::namespace(format!("failed to open {netns_path}"), Some(Box::new(e)))
    })?;

    handle
        .link()
        .set(link.header.index)
        .setns_by_fd(netns_file.as_fd().as_raw_fd())
        .execute()
        .await
        .map_err(|e| NetError::link(format!("failed to move {name} into {netns_path}"), e))
}

pub fn mac_address(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
        _ => None,
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]),
            "02:42:ac:11:00:02"
        );
        assert_eq!(format_mac(&[]), "");
    }

    #[test]
    fn test_no_device_error() {
        let mut msg = ErrorMessage::default();
        msg.code = NonZeroI32::new(-ENODEV);
        assert!(is_no_device(&msg));

        msg.code = NonZeroI32::new(-nix::libc::EPERM);
        assert!(!is_no_device(&msg));

        msg.code = None;
        assert!(!is_no_device(&msg));
    }
}
