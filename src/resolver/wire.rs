//! Minimal DNS message encoding for A/AAAA lookups.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ResolveCause;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

fn malformed(msg: impl Into<String>) -> ResolveCause {
    ResolveCause::Malformed(msg.into())
}

pub fn build_query(host: &str, qtype: u16, query_id: u16) -> Result<Vec<u8>, ResolveCause> {
    let qname = host.trim().trim_end_matches('.');
    if qname.is_empty() || qname.len() > 253 {
        return Err(ResolveCause::InvalidName(host.to_string()));
    }

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(&query_id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in qname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ResolveCause::InvalidName(host.to_string()));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(out)
}

pub fn response_id(response: &[u8]) -> Option<u16> {
    (response.len() >= 2).then(|| u16::from_be_bytes([response[0], response[1]]))
}

/// Addresses of type `qtype` in the answer section. NXDOMAIN yields an
/// empty list rather than an error.
pub fn parse_response(response: &[u8], query_id: u16, qtype: u16) -> Result<Vec<IpAddr>, ResolveCause> {
    if response.len() < 12 {
        return Err(malformed("DNS response too short"));
    }
    let id = u16::from_be_bytes([response[0], response[1]]);
    if id != query_id {
        return Err(malformed(format!(
            "DNS response id mismatch: expected {query_id}, got {id}"
        )));
    }
    let flags = u16::from_be_bytes([response[2], response[3]]);
    if flags & 0x8000 == 0 {
        return Err(malformed("DNS response missing QR flag"));
    }
    if flags & 0x0200 != 0 {
        return Err(malformed("DNS response was truncated"));
    }
    match flags & 0x000F {
        0 => {}
        3 => return Ok(Vec::new()),
        rcode => return Err(malformed(format!("DNS query failed with rcode {rcode}"))),
    }

    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;

    let mut offset = 12usize;
    for _ in 0..qdcount {
        offset = skip_name(response, offset)?;
        if offset + 4 > response.len() {
            return Err(malformed("DNS question truncated"));
        }
        offset += 4;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        offset = skip_name(response, offset)?;
        if offset + 10 > response.len() {
            return Err(malformed("DNS answer header truncated"));
        }
        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        let rr_class = u16::from_be_bytes([response[offset + 2], response[offset + 3]]);
        let rdlength = u16::from_be_bytes([response[offset + 8], response[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > response.len() {
            return Err(malformed("DNS answer rdata truncated"));
        }
        let rdata = &response[offset..offset + rdlength];
        if rr_class == CLASS_IN && rr_type == qtype {
            match (rr_type, rdata.len()) {
                (QTYPE_A, 4) => ips.push(IpAddr::V4(Ipv4Addr::new(
                    rdata[0], rdata[1], rdata[2], rdata[3],
                ))),
                (QTYPE_AAAA, 16) => {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(rdata);
                    ips.push(IpAddr::V6(Ipv6Addr::from(bytes)));
                }
                _ => {}
            }
        }
        offset += rdlength;
    }

    Ok(dedup_ips(ips))
}

fn skip_name(packet: &[u8], mut offset: usize) -> Result<usize, ResolveCause> {
    loop {
        let Some(&len) = packet.get(offset) else {
            return Err(malformed("DNS name out of bounds"));
        };
        if len == 0 {
            return Ok(offset + 1);
        }
        match len & 0xC0 {
            0xC0 => {
                if offset + 1 >= packet.len() {
                    return Err(malformed("DNS name compression pointer truncated"));
                }
                return Ok(offset + 2);
            }
            0 => {
                offset += 1 + len as usize;
                if offset > packet.len() {
                    return Err(malformed("DNS name label truncated in response"));
                }
            }
            _ => return Err(malformed("DNS name label has invalid high bits")),
        }
    }
}

pub fn dedup_ips(ips: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u16, flags: u16, ancount: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ancount.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&[
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ]);
        out.extend_from_slice(&QTYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    #[test]
    fn build_query_encodes_labels() {
        let query = build_query("example.com.", QTYPE_A, 0x1234).expect("build query");
        assert_eq!(&query[0..2], &0x1234u16.to_be_bytes());
        assert_eq!(query[12], 7);
        assert_eq!(&query[13..20], b"example");
        assert_eq!(query[20], 3);
        assert_eq!(&query[21..24], b"com");
        assert_eq!(query[24], 0);
    }

    #[test]
    fn build_query_rejects_empty_labels() {
        assert!(matches!(
            build_query("bad..name", QTYPE_A, 1),
            Err(ResolveCause::InvalidName(_))
        ));
    }

    #[test]
    fn parse_response_extracts_a_record() {
        let mut response = header(0x1234, 0x8180, 2);
        for rdata in [[1, 2, 3, 4], [1, 2, 3, 4]] {
            response.extend_from_slice(&[0xC0, 0x0C]);
            response.extend_from_slice(&QTYPE_A.to_be_bytes());
            response.extend_from_slice(&CLASS_IN.to_be_bytes());
            response.extend_from_slice(&60u32.to_be_bytes());
            response.extend_from_slice(&4u16.to_be_bytes());
            response.extend_from_slice(&rdata);
        }

        let ips = parse_response(&response, 0x1234, QTYPE_A).expect("parse response");
        assert_eq!(ips, vec!["1.2.3.4".parse::<IpAddr>().expect("ip")]);
    }

    #[test]
    fn parse_response_nxdomain_returns_empty() {
        let response = header(0x4321, 0x8183, 0);
        let ips = parse_response(&response, 0x4321, QTYPE_A).expect("parse response");
        assert!(ips.is_empty());
    }

    #[test]
    fn parse_response_rejects_other_ids() {
        let response = header(0x0001, 0x8180, 0);
        assert!(matches!(
            parse_response(&response, 0x0002, QTYPE_A),
            Err(ResolveCause::Malformed(_))
        ));
    }
}
