//! SOCKS5 wire format (RFC 1928, RFC 1929).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SocksError};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const USERPASS_VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Destination as written by the client; domains are resolved later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// Host part suitable for a resolver: the IP literal or the domain.
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(v4)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.ip().octets());
            }
            Self::Ip(SocketAddr::V6(v6)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.ip().octets());
            }
            Self::Domain(domain, _) => {
                out.push(ATYP_DOMAIN);
                out.push(domain.len().min(255) as u8);
                out.extend_from_slice(&domain.as_bytes()[..domain.len().min(255)]);
            }
        }
        out.extend_from_slice(&self.port().to_be_bytes());
    }

    /// Parse `ATYP ADDR PORT` from the front of `buf`, returning the
    /// address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let short = || SocksError::Malformed("address truncated".into());
        let atyp = *buf.first().ok_or_else(short)?;
        let (addr, end) = match atyp {
            ATYP_IPV4 => {
                let raw: [u8; 4] = buf.get(1..5).ok_or_else(short)?.try_into().map_err(|_| short())?;
                (TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(raw).into(), 0)), 5)
            }
            ATYP_IPV6 => {
                let raw: [u8; 16] = buf.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
                (TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(raw).into(), 0)), 17)
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                let raw = buf.get(2..2 + len).ok_or_else(short)?;
                let domain = String::from_utf8(raw.to_vec())
                    .map_err(|_| SocksError::Malformed("domain is not UTF-8".into()))?;
                (TargetAddr::Domain(domain, 0), 2 + len)
            }
            other => return Err(SocksError::AddressType(other)),
        };
        let port_bytes = buf.get(end..end + 2).ok_or_else(short)?;
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
        Ok((addr.with_port(port), end + 2))
    }

    fn with_port(self, port: u16) -> Self {
        match self {
            Self::Ip(addr) => Self::Ip(SocketAddr::new(addr.ip(), port)),
            Self::Domain(domain, _) => Self::Domain(domain, port),
        }
    }

    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<Self> {
        let addr = match atyp {
            ATYP_IPV4 => {
                let mut raw = [0u8; 4];
                reader.read_exact(&mut raw).await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), 0))
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 16];
                reader.read_exact(&mut raw).await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(raw)), 0))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                reader.read_exact(&mut raw).await?;
                let domain = String::from_utf8(raw)
                    .map_err(|_| SocksError::Malformed("domain is not UTF-8".into()))?;
                TargetAddr::Domain(domain, 0)
            }
            other => return Err(SocksError::AddressType(other)),
        };
        let port = reader.read_u16().await?;
        Ok(addr.with_port(port))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Credentials required from clients; `None` runs an open proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Method negotiation plus the optional username/password sub-negotiation.
pub async fn handshake<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = stream.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(SocksError::Version(ver));
    }
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if credentials.is_some() {
        AUTH_USERPASS
    } else {
        AUTH_NONE
    };
    if !methods.contains(&wanted) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, wanted]).await?;

    let Some(expected) = credentials else {
        return Ok(());
    };

    let ver = stream.read_u8().await?;
    if ver != USERPASS_VERSION {
        return Err(SocksError::Malformed(format!(
            "username/password version {ver:#04x}"
        )));
    }
    let ulen = stream.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    stream.read_exact(&mut username).await?;
    let plen = stream.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username).into_owned();
    if username == expected.username && password == expected.password.as_bytes() {
        stream.write_all(&[USERPASS_VERSION, 0x00]).await?;
        Ok(())
    } else {
        stream.write_all(&[USERPASS_VERSION, 0x01]).await?;
        Err(SocksError::AuthFailed(username))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
}

/// Read `VER CMD RSV ATYP DST.ADDR DST.PORT`.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Version(head[0]));
    }
    let target = TargetAddr::read_from(reader, head[3]).await?;
    Ok(Request {
        command: head[1],
        target,
    })
}

pub fn encode_reply(rep: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS_VERSION, rep, 0x00]);
    TargetAddr::Ip(bound).encode(&mut out);
    out
}

pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, rep: u8, bound: SocketAddr) -> io::Result<()> {
    writer.write_all(&encode_reply(rep, bound)).await?;
    writer.flush().await
}

pub fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Reply code for a request that failed with `err`.
pub fn reply_code(err: &SocksError) -> u8 {
    match err {
        SocksError::Resolve(_) => REP_HOST_UNREACHABLE,
        SocksError::UnsupportedCommand(_) => REP_CMD_NOT_SUPPORTED,
        SocksError::AddressType(_) => REP_ATYP_NOT_SUPPORTED,
        SocksError::Dial { source, .. } => match source.kind() {
            io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::AddrNotAvailable => {
                REP_NETWORK_UNREACHABLE
            }
            io::ErrorKind::HostUnreachable => REP_HOST_UNREACHABLE,
            io::ErrorKind::TimedOut => REP_TTL_EXPIRED,
            _ => REP_GENERAL_FAILURE,
        },
        _ => REP_GENERAL_FAILURE,
    }
}

/// One UDP relay datagram: `RSV(2) FRAG ATYP DST.ADDR DST.PORT DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub frag: u8,
    pub target: TargetAddr,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(SocksError::Malformed("UDP header truncated".into()));
        }
        let (target, used) = TargetAddr::decode(&buf[3..])?;
        Ok(Self {
            frag: buf[2],
            target,
            payload: &buf[3 + used..],
        })
    }
}

pub fn encode_datagram(target: &TargetAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.extend_from_slice(&[0, 0, 0]);
    target.encode(&mut out);
    out.extend_from_slice(payload);
    out
}
