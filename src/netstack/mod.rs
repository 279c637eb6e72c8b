//! Userspace TCP/IP stack bound to the tunnel's virtual addresses.
//!
//! [`TunnelStack`] owns a smoltcp interface driven by a single dataplane
//! task. IP packets move between that interface and a [`PacketTransport`];
//! callers get TCP streams and connected UDP sockets through [`Dialer`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::context::Context;
use crate::error::StackError;
use crate::transport::PacketTransport;

mod dataplane;
mod device;
mod tcp;
mod udp;

pub use tcp::TcpConn;
pub use udp::UdpConn;

pub(crate) const TCP_SOCKET_BUF: usize = 1024 * 1024;
pub(crate) const STREAM_BUF: usize = 65536;
pub(crate) const UDP_PACKET_CAP: usize = 65536;
pub(crate) const UDP_PACKET_SLOTS: usize = 64;
pub(crate) const LOCAL_PORT_START: u16 = 40000;
pub(crate) const LOCAL_PORT_END: u16 = 65000;
/// Handshake limit for TCP dials whose context carries no earlier deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_CAP: usize = 1024;
const CONN_CHANNEL_CAP: usize = 64;

/// Byte stream returned by a TCP dial.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Connected datagram socket.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn local_addr(&self) -> SocketAddr;
    fn peer_addr(&self) -> SocketAddr;
}

/// Dial capability consumed by the resolver and the SOCKS front-end.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a TCP connection to `remote`, abandoning the attempt when `ctx`
    /// is cancelled or its deadline passes.
    async fn dial_tcp(&self, ctx: &Context, remote: SocketAddr) -> Result<BoxedStream, StackError>;

    /// Bind a UDP socket (ephemeral when `local` is `None` or has port 0)
    /// connected to `remote`.
    async fn dial_udp(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Box<dyn DatagramConn>, StackError>;
}

/// Addresses the tunnel assigned to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAddrs {
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
}

impl StackAddrs {
    pub fn for_remote(&self, remote: IpAddr) -> Option<IpAddr> {
        match remote {
            IpAddr::V4(_) => Some(IpAddr::V4(self.ipv4)),
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => Some(IpAddr::V4(self.ipv4)),
            IpAddr::V6(_) => self.ipv6.map(IpAddr::V6),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => v4 == self.ipv4,
            IpAddr::V6(v6) => Some(v6) == self.ipv6,
        }
    }
}

pub(crate) struct TcpRequest {
    pub remote: SocketAddr,
    pub to_conn: mpsc::Sender<Bytes>,
    pub from_conn: mpsc::Receiver<Bytes>,
    pub reply: oneshot::Sender<Result<SocketAddr, StackError>>,
}

pub(crate) struct UdpRequest {
    pub local: Option<SocketAddr>,
    pub remote: SocketAddr,
    pub to_conn: mpsc::Sender<Bytes>,
    pub from_conn: mpsc::Receiver<Bytes>,
    pub reply: oneshot::Sender<Result<SocketAddr, StackError>>,
}

pub(crate) enum StackRequest {
    Tcp(TcpRequest),
    Udp(UdpRequest),
}

pub struct TunnelStack {
    req_tx: mpsc::Sender<StackRequest>,
    loop_notify: Arc<Notify>,
    addrs: StackAddrs,
    tcp_sockets: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelStack {
    /// Start the dataplane over `transport`. Must be called inside a tokio
    /// runtime.
    pub fn new(transport: Arc<dyn PacketTransport>, addrs: StackAddrs, mtu: usize) -> Self {
        Self::with_connect_timeout(transport, addrs, mtu, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Like [`TunnelStack::new`], failing TCP handshakes that take longer
    /// than `connect_timeout` with [`StackError::TimedOut`].
    pub fn with_connect_timeout(
        transport: Arc<dyn PacketTransport>,
        addrs: StackAddrs,
        mtu: usize,
        connect_timeout: Duration,
    ) -> Self {
        let mtu = mtu.min(transport.mtu());
        let tcp_sockets = Arc::new(AtomicUsize::new(0));
        let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAP);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAP);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAP);
        let loop_notify = Arc::new(Notify::new());

        let dataplane = dataplane::Dataplane::new(
            addrs,
            mtu,
            req_rx,
            inbound_rx,
            outbound_tx,
            loop_notify.clone(),
            connect_timeout,
            tcp_sockets.clone(),
        );
        let tasks = vec![
            tokio::spawn(dataplane.run()),
            tokio::spawn(dataplane::pump_inbound(transport.clone(), inbound_tx)),
            tokio::spawn(dataplane::pump_outbound(transport, outbound_rx)),
        ];
        info!(ipv4 = ?addrs.ipv4, ipv6 = ?addrs.ipv6, mtu = mtu, "tunnel_stack_started");

        Self {
            req_tx,
            loop_notify,
            addrs,
            tcp_sockets,
            tasks,
        }
    }

    pub fn addrs(&self) -> StackAddrs {
        self.addrs
    }

    /// TCP sockets the stack still holds, including ones lingering after close.
    pub fn tcp_sockets(&self) -> usize {
        self.tcp_sockets.load(Ordering::Relaxed)
    }

    async fn submit(&self, req: StackRequest) -> Result<(), StackError> {
        self.req_tx
            .send(req)
            .await
            .map_err(|_| StackError::StackClosed)?;
        self.loop_notify.notify_one();
        Ok(())
    }

    pub async fn connect_tcp(&self, ctx: &Context, remote: SocketAddr) -> Result<TcpConn, StackError> {
        let (to_conn, conn_rx) = mpsc::channel(CONN_CHANNEL_CAP);
        let (conn_tx, from_conn) = mpsc::channel(CONN_CHANNEL_CAP);
        let (reply, reply_rx) = oneshot::channel();
        let req = TcpRequest {
            remote,
            to_conn,
            from_conn,
            reply,
        };

        // Dropping `reply_rx` on cancellation tells the dataplane to abort
        // the half-open socket.
        let local = ctx
            .run(async {
                self.submit(StackRequest::Tcp(req)).await?;
                reply_rx.await.map_err(|_| StackError::StackClosed)?
            })
            .await??;
        Ok(TcpConn::new(
            conn_rx,
            conn_tx,
            self.loop_notify.clone(),
            local,
            remote,
        ))
    }

    pub async fn bind_udp(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<UdpConn, StackError> {
        let (to_conn, conn_rx) = mpsc::channel(CONN_CHANNEL_CAP);
        let (conn_tx, from_conn) = mpsc::channel(CONN_CHANNEL_CAP);
        let (reply, reply_rx) = oneshot::channel();
        self.submit(StackRequest::Udp(UdpRequest {
            local,
            remote,
            to_conn,
            from_conn,
            reply,
        }))
        .await?;
        let bound = reply_rx.await.map_err(|_| StackError::StackClosed)??;
        Ok(UdpConn::new(
            conn_rx,
            conn_tx,
            self.loop_notify.clone(),
            bound,
            remote,
        ))
    }
}

#[async_trait]
impl Dialer for TunnelStack {
    async fn dial_tcp(&self, ctx: &Context, remote: SocketAddr) -> Result<BoxedStream, StackError> {
        Ok(Box::new(self.connect_tcp(ctx, remote).await?))
    }

    async fn dial_udp(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Box<dyn DatagramConn>, StackError> {
        Ok(Box::new(self.bind_udp(local, remote).await?))
    }
}

impl Drop for TunnelStack {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
