//! Virtual network interface collaborators.
//!
//! [`DevicePlatform`] is the seam between the tunnel and whatever the host
//! offers for creating and configuring a TUN-style device. The Linux
//! implementation lives in [`linux`]; tests use in-memory platforms.

use std::fmt;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::DeviceError;

pub mod addr;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
mod netlink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Host prefix length used when assigning a single tunnel address.
    pub fn host_prefix(self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("IPv4"),
            Self::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Identifier derived from an interface name; the same name always yields
/// the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StableId([u8; 16]);

impl StableId {
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

/// Packet I/O on a created device.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    fn name(&self) -> &str;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Host operations for creating and configuring a virtual interface.
///
/// Errors keep the platform's meaning: an address that is already present
/// is [`DeviceError::AddressAlreadyAssigned`], missing privileges are
/// [`DeviceError::PermissionDenied`].
pub trait DevicePlatform: Send + Sync {
    type Device: PacketDevice + 'static;

    fn create(&self, name: &str, mtu: u16) -> Result<Self::Device, DeviceError>;

    fn add_address(&self, device: &Self::Device, ip: IpAddr) -> Result<(), DeviceError>;

    fn set_mtu(
        &self,
        device: &Self::Device,
        family: AddressFamily,
        mtu: u16,
    ) -> Result<(), DeviceError>;

    /// Addresses currently assigned to the device.
    fn addresses(&self, device: &Self::Device) -> Result<Vec<IpAddr>, DeviceError>;

    fn stable_id(&self, name: &str) -> StableId {
        StableId::from_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        assert_eq!(StableId::from_name("tunplane"), StableId::from_name("tunplane"));
        assert_ne!(StableId::from_name("tunplane"), StableId::from_name("tunplane0"));
    }

    #[test]
    fn stable_id_renders_guid_layout() {
        let text = StableId::from_name("tunplane").to_string();
        let groups: Vec<usize> = text.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert!(text.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    }

    #[test]
    fn family_of_address() {
        assert_eq!(AddressFamily::of("10.0.0.1".parse().expect("v4")), AddressFamily::Ipv4);
        assert_eq!(AddressFamily::of("fd00::1".parse().expect("v6")), AddressFamily::Ipv6);
        assert_eq!(AddressFamily::Ipv6.host_prefix(), 128);
    }
}
