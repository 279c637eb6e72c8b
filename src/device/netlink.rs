//! rtnetlink requests for interface configuration (Linux only).
//!
//! Covers the three operations the TUN bring-up needs:
//! - `set_link_up` / `set_link_mtu` via RTM_NEWLINK
//! - `add_address` via RTM_NEWADDR
//! - `list_addresses` via an RTM_GETADDR dump

use std::io;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::socket::{recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType};

use super::addr::{decode_ip, encode_ip};
use super::AddressFamily as IpFamily;
use crate::error::DeviceError;

const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const RTM_GETADDR: u16 = 22;

const NLM_F_REQUEST: u16 = 1;
const NLM_F_ACK: u16 = 4;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_DUMP: u16 = 0x300;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_HDR_LEN: usize = 16;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFLA_MTU: u16 = 4;
const IFF_UP: u32 = 1;
const IFADDRMSG_LEN: usize = 8;

const EPERM: i32 = 1;
const EACCES: i32 = 13;
const EEXIST: i32 = 17;

static SEQ: AtomicU32 = AtomicU32::new(1);

struct NlMsg {
    buf: Vec<u8>,
}

impl NlMsg {
    fn new(msg_type: u16, flags: u16) -> Self {
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let mut buf = Vec::with_capacity(128);
        // nlmsghdr: len, type, flags, seq, pid
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        Self { buf }
    }

    fn add_ifaddrmsg(&mut self, family: u8, prefix_len: u8, index: u32) {
        // family, prefixlen, flags, scope (universe), index
        self.buf.extend_from_slice(&[family, prefix_len, 0, 0]);
        self.buf.extend_from_slice(&index.to_ne_bytes());
    }

    fn add_ifinfomsg(&mut self, index: u32, flags: u32, change: u32) {
        // family (AF_UNSPEC), pad, type, index, flags, change
        self.buf.extend_from_slice(&[0, 0]);
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(index as i32).to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&change.to_ne_bytes());
    }

    fn add_attr(&mut self, ty: u16, data: &[u8]) {
        let nla_len = 4 + data.len();
        self.buf.extend_from_slice(&(nla_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(data);
        let pad = (4 - (data.len() % 4)) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    fn finalize(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        &self.buf
    }
}

fn parse_attrs(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let nla_len = u16::from_ne_bytes([data[offset], data[offset + 1]]) as usize;
        if nla_len < 4 || offset + nla_len > data.len() {
            break;
        }
        let nla_type = u16::from_ne_bytes([data[offset + 2], data[offset + 3]]) & 0x3fff;
        out.push((nla_type, &data[offset + 4..offset + nla_len]));
        offset += (nla_len + 3) & !3;
    }
    out
}

/// One netlink message: type and payload after the header.
struct Message<'a> {
    ty: u16,
    payload: &'a [u8],
}

fn split_messages(data: &[u8]) -> Vec<Message<'_>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + NLMSG_HDR_LEN <= data.len() {
        let len = u32::from_ne_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if len < NLMSG_HDR_LEN || offset + len > data.len() {
            break;
        }
        let ty = u16::from_ne_bytes([data[offset + 4], data[offset + 5]]);
        out.push(Message {
            ty,
            payload: &data[offset + NLMSG_HDR_LEN..offset + len],
        });
        offset += (len + 3) & !3;
    }
    out
}

/// errno carried by an NLMSG_ERROR payload (0 is a plain ACK).
fn error_errno(payload: &[u8]) -> i32 {
    match payload.get(..4) {
        Some(b) => -i32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

fn classify(op: &'static str, errno: i32, ip: Option<IpAddr>) -> DeviceError {
    match (errno, ip) {
        (EEXIST, Some(ip)) => DeviceError::AddressAlreadyAssigned(ip),
        (EPERM | EACCES, _) => DeviceError::PermissionDenied(op.to_string()),
        _ => DeviceError::Os {
            op,
            source: io::Error::from_raw_os_error(errno),
        },
    }
}

fn open() -> Result<OwnedFd, DeviceError> {
    socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        Some(SockProtocol::NetlinkRoute),
    )
    .map_err(|e| DeviceError::Os {
        op: "netlink socket",
        source: io::Error::from(e),
    })
}

fn nl_send(fd: &OwnedFd, op: &'static str, data: &[u8]) -> Result<(), DeviceError> {
    send(fd.as_raw_fd(), data, MsgFlags::empty()).map_err(|e| DeviceError::Os {
        op,
        source: io::Error::from(e),
    })?;
    Ok(())
}

fn nl_recv(fd: &OwnedFd, op: &'static str, buf: &mut [u8]) -> Result<usize, DeviceError> {
    recv(fd.as_raw_fd(), buf, MsgFlags::empty()).map_err(|e| DeviceError::Os {
        op,
        source: io::Error::from(e),
    })
}

/// Send a request with NLM_F_ACK and map the kernel's answer.
fn transact(op: &'static str, msg: &mut NlMsg, ip: Option<IpAddr>) -> Result<(), DeviceError> {
    let fd = open()?;
    nl_send(&fd, op, msg.finalize())?;
    let mut buf = vec![0u8; 8192];
    loop {
        let n = nl_recv(&fd, op, &mut buf)?;
        for message in split_messages(&buf[..n]) {
            if message.ty == NLMSG_ERROR {
                return match error_errno(message.payload) {
                    0 => Ok(()),
                    errno => Err(classify(op, errno, ip)),
                };
            }
        }
    }
}

pub fn set_link_up(index: u32) -> Result<(), DeviceError> {
    let mut msg = NlMsg::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    msg.add_ifinfomsg(index, IFF_UP, IFF_UP);
    transact("RTM_NEWLINK up", &mut msg, None)
}

pub fn set_link_mtu(index: u32, mtu: u16) -> Result<(), DeviceError> {
    let mut msg = NlMsg::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    msg.add_ifinfomsg(index, 0, 0);
    msg.add_attr(IFLA_MTU, &u32::from(mtu).to_ne_bytes());
    transact("RTM_NEWLINK mtu", &mut msg, None)
}

fn new_address_msg(index: u32, ip: IpAddr) -> NlMsg {
    let (family, bytes) = encode_ip(ip);
    let mut msg = NlMsg::new(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    );
    msg.add_ifaddrmsg(family, IpFamily::of(ip).host_prefix(), index);
    msg.add_attr(IFA_LOCAL, &bytes);
    msg.add_attr(IFA_ADDRESS, &bytes);
    msg
}

pub fn add_address(index: u32, ip: IpAddr) -> Result<(), DeviceError> {
    let mut msg = new_address_msg(index, ip);
    transact("RTM_NEWADDR", &mut msg, Some(ip))
}

/// Decode one RTM_NEWADDR dump entry, keeping it only if it belongs to `index`.
fn parse_address_entry(payload: &[u8], index: u32) -> Result<Option<IpAddr>, DeviceError> {
    if payload.len() < IFADDRMSG_LEN {
        return Ok(None);
    }
    let family = payload[0];
    let entry_index = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if entry_index != index {
        return Ok(None);
    }
    let attrs = parse_attrs(&payload[IFADDRMSG_LEN..]);
    let raw = attrs
        .iter()
        .find(|(ty, _)| *ty == IFA_LOCAL)
        .or_else(|| attrs.iter().find(|(ty, _)| *ty == IFA_ADDRESS));
    match raw {
        Some((_, bytes)) => decode_ip(family, bytes).map(Some),
        None => Ok(None),
    }
}

pub fn list_addresses(index: u32) -> Result<Vec<IpAddr>, DeviceError> {
    let fd = open()?;
    let mut msg = NlMsg::new(RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP);
    msg.add_ifaddrmsg(0, 0, 0);
    nl_send(&fd, "RTM_GETADDR", msg.finalize())?;

    let mut out = Vec::new();
    let mut buf = vec![0u8; 32768];
    loop {
        let n = nl_recv(&fd, "RTM_GETADDR", &mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        for message in split_messages(&buf[..n]) {
            match message.ty {
                NLMSG_DONE => return Ok(out),
                NLMSG_ERROR => {
                    let errno = error_errno(message.payload);
                    if errno != 0 {
                        return Err(classify("RTM_GETADDR", errno, None));
                    }
                }
                RTM_NEWADDR => {
                    if let Some(ip) = parse_address_entry(message.payload, index)? {
                        out.push(ip);
                    }
                }
                _ => {}
            }
        }
    }
}
