use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::device::AddressFamily;

/// Failures raised by the userspace network stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("local port {0} is already bound in the tunnel stack")]
    PortInUse(SocketAddr),

    #[error("local address {0} is not assigned to the tunnel stack")]
    AddrNotAvailable(SocketAddr),

    #[error("{family} is not available on this tunnel (target {target})")]
    FamilyUnavailable {
        family: AddressFamily,
        target: SocketAddr,
    },

    #[error("no free local port left in the tunnel stack")]
    PortsExhausted,

    #[error("connection to {0} refused")]
    ConnectionRefused(SocketAddr),

    #[error("connection to {0} timed out")]
    TimedOut(SocketAddr),

    #[error("tunnel stack is shut down")]
    StackClosed,

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl StackError {
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::PortInUse(_) => io::ErrorKind::AddrInUse,
            Self::AddrNotAvailable(_) | Self::PortsExhausted => io::ErrorKind::AddrNotAvailable,
            Self::FamilyUnavailable { .. } => io::ErrorKind::NetworkUnreachable,
            Self::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
            Self::TimedOut(_) => io::ErrorKind::TimedOut,
            Self::StackClosed => io::ErrorKind::BrokenPipe,
            Self::Context(ContextError::Cancelled) => io::ErrorKind::Interrupted,
            Self::Context(ContextError::DeadlineExceeded) => io::ErrorKind::TimedOut,
        }
    }
}

/// Host-level rendition of a stack error. Port conflicts keep the familiar
/// "address already in use" wording so callers can retry on the error kind.
impl From<StackError> for io::Error {
    fn from(err: StackError) -> Self {
        match err {
            StackError::PortInUse(addr) => io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr}: address already in use"),
            ),
            other => io::Error::new(other.kind(), other),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Why a name could not be turned into an address.
#[derive(Debug, Error)]
pub enum ResolveCause {
    #[error("no A or AAAA records")]
    NotFound,

    #[error("no DNS servers configured")]
    NoServers,

    #[error("malformed DNS response: {0}")]
    Malformed(String),

    #[error("invalid host name {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("tunnel I/O: {0}")]
    Io(#[from] io::Error),
}

/// Single resolution failure kind; the cause is kept for diagnostics.
#[derive(Debug, Error)]
#[error("resolving {host} failed: {cause}")]
pub struct ResolveError {
    pub host: String,
    #[source]
    pub cause: ResolveCause,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, cause: impl Into<ResolveCause>) -> Self {
        Self {
            host: host.into(),
            cause: cause.into(),
        }
    }
}

/// Virtual interface (device) and configuration failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("address {0} is already assigned to the interface")]
    AddressAlreadyAssigned(IpAddr),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to create interface {name}: {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid address encoding: {0}")]
    InvalidAddress(String),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to set {family} address: {source}")]
    SetAddress {
        family: AddressFamily,
        #[source]
        source: Box<DeviceError>,
    },

    #[error("failed to set {family} MTU: {source}")]
    SetMtu {
        family: AddressFamily,
        #[source]
        source: Box<DeviceError>,
    },

    #[error("interface bring-up failed: {}", join_failures(.0))]
    BringUp(Vec<DeviceError>),
}

fn join_failures(failures: &[DeviceError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the SOCKS5 front-end for a single control connection.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("UDP association for {0} already exists")]
    AssociationExists(String),

    #[error("client closed the control connection before dial completed")]
    ClientGone,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SocksError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_maps_to_addr_in_use() {
        let addr: SocketAddr = "172.16.0.2:5353".parse().expect("addr");
        let err: io::Error = StackError::PortInUse(addr).into();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(err.to_string().contains("address already in use"));
    }

    #[test]
    fn bring_up_lists_every_failure() {
        let err = DeviceError::BringUp(vec![
            DeviceError::SetAddress {
                family: AddressFamily::Ipv4,
                source: Box::new(DeviceError::PermissionDenied("RTM_NEWADDR".into())),
            },
            DeviceError::SetMtu {
                family: AddressFamily::Ipv6,
                source: Box::new(DeviceError::PermissionDenied("mtu".into())),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("failed to set IPv4 address"));
        assert!(text.contains("failed to set IPv6 MTU"));
    }
}
