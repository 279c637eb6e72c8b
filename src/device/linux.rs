use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{netlink, AddressFamily, DevicePlatform, PacketDevice, StableId};
use crate::error::DeviceError;

/// TUN devices through `tun-rs`, configured over rtnetlink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

pub struct LinuxTun {
    name: String,
    index: u32,
    id: StableId,
    inner: tun_rs::AsyncDevice,
}

impl LinuxTun {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn stable_id(&self) -> StableId {
        self.id
    }
}

fn create_error(name: &str, err: io::Error) -> DeviceError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        DeviceError::PermissionDenied(format!("create {name}: {err}"))
    } else {
        DeviceError::CreateFailed {
            name: name.to_string(),
            source: err,
        }
    }
}

impl DevicePlatform for LinuxPlatform {
    type Device = LinuxTun;

    fn create(&self, name: &str, mtu: u16) -> Result<LinuxTun, DeviceError> {
        let inner = tun_rs::DeviceBuilder::new()
            .name(name)
            .mtu(mtu)
            .build_async()
            .map_err(|e| create_error(name, e))?;
        let index = nix::net::if_::if_nametoindex(name).map_err(|e| DeviceError::Os {
            op: "if_nametoindex",
            source: io::Error::from(e),
        })?;
        netlink::set_link_up(index)?;
        let id = self.stable_id(name);
        info!(name = name, index = index, id = %id, "tun_device_created");
        Ok(LinuxTun {
            name: name.to_string(),
            index,
            id,
            inner,
        })
    }

    fn add_address(&self, device: &LinuxTun, ip: IpAddr) -> Result<(), DeviceError> {
        netlink::add_address(device.index, ip)?;
        debug!(name = %device.name, ip = ?ip, "tun_address_added");
        Ok(())
    }

    fn set_mtu(&self, device: &LinuxTun, family: AddressFamily, mtu: u16) -> Result<(), DeviceError> {
        match family {
            AddressFamily::Ipv4 => netlink::set_link_mtu(device.index, mtu),
            AddressFamily::Ipv6 => {
                let path = format!("/proc/sys/net/ipv6/conf/{}/mtu", device.name);
                std::fs::write(&path, format!("{mtu}\n")).map_err(|e| {
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        DeviceError::PermissionDenied(path)
                    } else {
                        DeviceError::Os {
                            op: "write IPv6 MTU",
                            source: e,
                        }
                    }
                })
            }
        }
    }

    fn addresses(&self, device: &LinuxTun) -> Result<Vec<IpAddr>, DeviceError> {
        netlink::list_addresses(device.index)
    }
}

#[async_trait]
impl PacketDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.inner.send(packet).await
    }
}
