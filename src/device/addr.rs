//! Conversions between [`IpAddr`] and the raw (family, bytes) form used in
//! kernel messages. Every decode checks the family tag and the length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::AddressFamily;
use crate::error::DeviceError;

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

pub fn family_tag(family: AddressFamily) -> u8 {
    match family {
        AddressFamily::Ipv4 => AF_INET,
        AddressFamily::Ipv6 => AF_INET6,
    }
}

pub fn family_from_tag(tag: u8) -> Result<AddressFamily, DeviceError> {
    match tag {
        AF_INET => Ok(AddressFamily::Ipv4),
        AF_INET6 => Ok(AddressFamily::Ipv6),
        other => Err(DeviceError::InvalidAddress(format!(
            "unknown address family {other}"
        ))),
    }
}

pub fn encode_ip(ip: IpAddr) -> (u8, Vec<u8>) {
    match ip {
        IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
        IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
    }
}

pub fn decode_ip(tag: u8, bytes: &[u8]) -> Result<IpAddr, DeviceError> {
    match family_from_tag(tag)? {
        AddressFamily::Ipv4 => {
            let octets: [u8; 4] = bytes.try_into().map_err(|_| {
                DeviceError::InvalidAddress(format!("IPv4 address needs 4 bytes, got {}", bytes.len()))
            })?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AddressFamily::Ipv6 => {
            let octets: [u8; 16] = bytes.try_into().map_err(|_| {
                DeviceError::InvalidAddress(format!(
                    "IPv6 address needs 16 bytes, got {}",
                    bytes.len()
                ))
            })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_matches_encoded_family() {
        let ip: IpAddr = "2606:4700:110:8a36::2".parse().expect("v6");
        let (tag, bytes) = encode_ip(ip);
        assert_eq!(tag, AF_INET6);
        assert_eq!(decode_ip(tag, &bytes).expect("decode"), ip);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let err = decode_ip(AF_INET, &[10, 0, 0, 1, 0]).expect_err("5 bytes");
        assert!(err.to_string().contains("needs 4 bytes"));
        let err = decode_ip(AF_INET6, &[0u8; 4]).expect_err("short v6");
        assert!(err.to_string().contains("needs 16 bytes"));
    }

    #[test]
    fn decode_rejects_unknown_family() {
        let err = decode_ip(7, &[0u8; 4]).expect_err("family 7");
        assert!(matches!(err, DeviceError::InvalidAddress(_)));
    }
}
