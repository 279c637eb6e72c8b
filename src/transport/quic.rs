use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use bytes::Bytes;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use tracing::{debug, info};

use super::PacketTransport;
use crate::congestion;
use crate::context::Context;

const DEFAULT_DATAGRAM_MTU: usize = 1200;

#[derive(Debug, Clone)]
pub struct QuicSettings {
    pub server: SocketAddr,
    pub server_name: String,
    pub alpn: Vec<String>,
    pub keepalive: Duration,
    pub idle_timeout: Duration,
}

/// IP packets carried one per QUIC datagram.
pub struct QuicTransport {
    endpoint: Endpoint,
    conn: Connection,
}

impl QuicTransport {
    pub async fn dial(ctx: &Context, settings: &QuicSettings) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = if settings.server.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = Endpoint::client(bind_addr).context("create QUIC endpoint")?;
        let client_config = client_config(settings)?;

        let connecting = endpoint
            .connect_with(client_config, settings.server, &settings.server_name)
            .with_context(|| format!("connect QUIC to {}", settings.server))?;
        let conn = ctx
            .run(connecting)
            .await
            .map_err(|e| anyhow!("QUIC handshake with {}: {e}", settings.server))?
            .with_context(|| format!("QUIC handshake with {}", settings.server))?;

        info!(
            remote = ?conn.remote_address(),
            max_datagram = ?conn.max_datagram_size(),
            "quic_transport_connected"
        );
        Ok(Self { endpoint, conn })
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }
}

fn client_config(settings: &QuicSettings) -> anyhow::Result<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!(error = %err, "native_cert_load_error");
    }
    for cert in native.certs {
        roots.add(cert).ok();
    }

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = settings.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();

    let quic_tls = QuicClientConfig::try_from(tls).context("build QUIC TLS config")?;
    let mut client_config = ClientConfig::new(Arc::new(quic_tls));

    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(settings.keepalive));
    transport.max_idle_timeout(Some(
        settings
            .idle_timeout
            .try_into()
            .context("QUIC idle timeout out of range")?,
    ));
    // The connection is dialed at a known address; the observed remote of
    // the established connection is that same address.
    congestion::apply(&mut transport, Some(settings.server));
    client_config.transport_config(Arc::new(transport));
    Ok(client_config)
}

#[async_trait]
impl PacketTransport for QuicTransport {
    async fn send_packet(&self, packet: Bytes) -> io::Result<()> {
        self.conn
            .send_datagram(packet)
            .map_err(io::Error::other)
    }

    async fn recv_packet(&self) -> io::Result<Bytes> {
        self.conn
            .read_datagram()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))
    }

    fn mtu(&self) -> usize {
        self.conn
            .max_datagram_size()
            .unwrap_or(DEFAULT_DATAGRAM_MTU)
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.conn.close(0u32.into(), b"closing");
        self.endpoint.close(0u32.into(), b"closing");
    }
}
