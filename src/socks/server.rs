use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::association::AssociationTable;
use super::datagram::DatagramHandler;
use super::flow::{FlowTracker, Protocol};
use super::protocol::{
    self, Credentials, Request, TargetAddr, CMD_CONNECT, CMD_UDP_ASSOCIATE, REP_CMD_NOT_SUPPORTED,
    REP_GENERAL_FAILURE, REP_SUCCESS,
};
use super::relay::relay;
use crate::context::Context;
use crate::error::{Result, SocksError};
use crate::netstack::{BoxedStream, Dialer};
use crate::resolver::Resolver;

#[derive(Debug, Clone)]
pub struct SocksSettings {
    pub listen: SocketAddr,
    pub credentials: Option<Credentials>,
    /// Per-read idle limit on CONNECT flows; `None` waits forever.
    pub tcp_idle_timeout: Option<Duration>,
    pub udp_idle_timeout: Duration,
}

struct Shared {
    settings: SocksSettings,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    associations: Arc<AssociationTable>,
    flows: Arc<FlowTracker>,
    relay_port: u16,
}

/// SOCKS5 listener. The UDP relay socket shares the TCP listener's address.
pub struct SocksServer {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    shared: Arc<Shared>,
    datagrams: Arc<DatagramHandler>,
}

impl SocksServer {
    pub async fn bind(
        settings: SocksSettings,
        resolver: Arc<dyn Resolver>,
        dialer: Arc<dyn Dialer>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(settings.listen)
            .await
            .with_context(|| format!("failed to bind SOCKS listener on {}", settings.listen))?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind SOCKS UDP relay on {local}"))?;

        let associations = AssociationTable::new();
        let flows = FlowTracker::new();
        let datagrams = DatagramHandler::new(
            associations.clone(),
            resolver.clone(),
            dialer.clone(),
            flows.clone(),
            settings.udp_idle_timeout,
        );
        let shared = Arc::new(Shared {
            relay_port: udp.local_addr()?.port(),
            settings,
            resolver,
            dialer,
            associations,
            flows,
        });
        Ok(Self {
            listener,
            udp: Arc::new(udp),
            shared,
            datagrams,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn associations(&self) -> Arc<AssociationTable> {
        self.shared.associations.clone()
    }

    pub fn flows(&self) -> Arc<FlowTracker> {
        self.shared.flows.clone()
    }

    pub fn datagrams(&self) -> Arc<DatagramHandler> {
        self.datagrams.clone()
    }

    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            listen = ?self.listener.local_addr().ok(),
            auth = self.shared.settings.credentials.is_some(),
            "socks5_listening"
        );
        let udp_task = tokio::spawn(self.datagrams.clone().run(self.udp.clone(), shutdown.clone()));

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = ?e.to_string(), "socks5_accept_failed");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            debug!(peer = ?peer, "socks5_accepted");
            tokio::spawn(handle_client(self.shared.clone(), stream, peer));
        }

        let _ = udp_task.await;
        info!("socks5_stopped");
        Ok(())
    }
}

async fn handle_client(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    match serve_client(&shared, stream, peer).await {
        Ok(()) => debug!(peer = ?peer, "socks5_closed"),
        Err(SocksError::ClientGone) => debug!(peer = ?peer, "socks5_client_gone"),
        Err(e) => debug!(peer = ?peer, error = ?e.to_string(), "socks5_request_failed"),
    }
}

async fn serve_client(shared: &Shared, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    protocol::handshake(&mut stream, shared.settings.credentials.as_ref()).await?;
    let request = match protocol::read_request(&mut stream).await {
        Ok(request) => request,
        Err(e @ SocksError::AddressType(_)) => {
            protocol::write_reply(&mut stream, protocol::reply_code(&e), protocol::unspecified())
                .await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match request.command {
        CMD_CONNECT => connect(shared, stream, peer, request.target).await,
        CMD_UDP_ASSOCIATE => associate(shared, stream, peer, request).await,
        other => {
            protocol::write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, protocol::unspecified())
                .await?;
            Err(SocksError::UnsupportedCommand(other))
        }
    }
}

/// Resolve and dial `target` through the tunnel.
async fn dial_target(shared: &Shared, ctx: &Context, target: &TargetAddr) -> Result<(BoxedStream, SocketAddr)> {
    let (dial_ctx, ip) = shared.resolver.resolve(ctx, &target.host()).await?;
    let remote = SocketAddr::new(ip, target.port());
    let stream = shared
        .dialer
        .dial_tcp(&dial_ctx, remote)
        .await
        .map_err(|e| SocksError::Dial {
            addr: remote,
            source: e.into(),
        })?;
    Ok((stream, remote))
}

/// Resolves once the client closes (or errors) its side; pending data
/// yields `false`.
async fn client_closed(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    !matches!(stream.peek(&mut probe).await, Ok(n) if n > 0)
}

async fn connect(shared: &Shared, mut stream: TcpStream, peer: SocketAddr, target: TargetAddr) -> Result<()> {
    let flow = shared.flows.open(Protocol::Tcp, peer, target.to_string());
    let ctx = Context::background();

    let dial = dial_target(shared, &ctx, &target);
    tokio::pin!(dial);
    let mut watching = true;
    let outcome = loop {
        tokio::select! {
            out = &mut dial => break out,
            gone = client_closed(&stream), if watching => {
                watching = false;
                if gone {
                    ctx.cancel();
                }
            }
        }
    };

    let (tunnel, remote) = match outcome {
        Ok(v) => v,
        Err(_) if ctx.is_cancelled() => return Err(SocksError::ClientGone),
        Err(e) => {
            warn!(peer = ?peer, target = %target, error = ?e.to_string(), "socks5_connect_failed");
            protocol::write_reply(&mut stream, protocol::reply_code(&e), protocol::unspecified())
                .await?;
            return Err(e);
        }
    };

    flow.activate(remote);
    protocol::write_reply(&mut stream, REP_SUCCESS, protocol::unspecified()).await?;
    debug!(peer = ?peer, target = %target, remote = ?remote, "socks5_connect_established");

    relay(stream, tunnel, shared.settings.tcp_idle_timeout).await;
    flow.closing();
    Ok(())
}

/// Key for datagrams of this association: the endpoint the client said it
/// would send from, filling in the control connection's IP when the client
/// left it unspecified. A zero port matches any port on that IP.
fn association_key(declared: &TargetAddr, peer: SocketAddr) -> (SocketAddr, bool) {
    match declared {
        TargetAddr::Ip(addr) if addr.port() != 0 => {
            let ip = if addr.ip().is_unspecified() {
                peer.ip()
            } else {
                addr.ip()
            };
            (SocketAddr::new(ip, addr.port()), false)
        }
        TargetAddr::Domain(_, port) if *port != 0 => (SocketAddr::new(peer.ip(), *port), false),
        _ => (peer, true),
    }
}

async fn associate(shared: &Shared, mut stream: TcpStream, peer: SocketAddr, request: Request) -> Result<()> {
    let (key, any_port) = association_key(&request.target, peer);
    let guard = match shared.associations.insert(key, peer, any_port) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(peer = ?peer, key = ?key, "udp_association_rejected");
            protocol::write_reply(&mut stream, REP_GENERAL_FAILURE, protocol::unspecified())
                .await?;
            return Err(e);
        }
    };

    let bound = SocketAddr::new(stream.local_addr()?.ip(), shared.relay_port);
    protocol::write_reply(&mut stream, REP_SUCCESS, bound).await?;
    info!(peer = ?peer, key = ?key, relay = ?bound, "udp_association_opened");

    let mut sink = [0u8; 512];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    guard.release();
    info!(peer = ?peer, key = ?key, "udp_association_closed");
    Ok(())
}
