//! Packet transports carrying raw IP packets to and from the tunnel server.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::config::TransportConfig;
use crate::context::Context;

#[cfg(test)]
pub(crate) mod memory;
pub mod quic;
pub mod wireguard;

pub use quic::{QuicSettings, QuicTransport};
pub use wireguard::{WireGuardSettings, WireGuardTransport};

/// One IP packet per call in each direction.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn send_packet(&self, packet: Bytes) -> io::Result<()>;

    /// Next packet from the tunnel. An error means the transport is gone.
    async fn recv_packet(&self) -> io::Result<Bytes>;

    /// Largest IP packet the transport can carry.
    fn mtu(&self) -> usize;
}

/// Dial the transport described by `config`. `mtu` is the inner packet
/// size the tunnel should carry.
pub async fn connect(
    ctx: &Context,
    config: &TransportConfig,
    mtu: u16,
) -> anyhow::Result<Arc<dyn PacketTransport>> {
    match config {
        TransportConfig::Quic {
            server,
            server_name,
            alpn,
            keepalive_secs,
            idle_timeout_secs,
        } => {
            let settings = QuicSettings {
                server: *server,
                server_name: server_name.clone(),
                alpn: alpn.clone(),
                keepalive: Duration::from_secs(*keepalive_secs),
                idle_timeout: Duration::from_secs(*idle_timeout_secs),
            };
            let transport = QuicTransport::dial(ctx, &settings).await?;
            info!(server = ?server, mtu = transport.mtu(), "transport_quic_ready");
            Ok(Arc::new(transport))
        }
        TransportConfig::Wireguard {
            private_key,
            peer_public_key,
            preshared_key,
            endpoint,
            persistent_keepalive,
        } => {
            let settings = WireGuardSettings {
                private_key: wireguard::decode_key(private_key)?,
                peer_public_key: wireguard::decode_key(peer_public_key)?,
                preshared_key: preshared_key
                    .as_deref()
                    .map(wireguard::decode_key)
                    .transpose()?,
                endpoint: *endpoint,
                keepalive: *persistent_keepalive,
                link_mtu: usize::from(mtu) + wireguard::WG_OVERHEAD,
            };
            let transport = ctx.run(WireGuardTransport::connect(&settings)).await??;
            info!(endpoint = ?endpoint, mtu = transport.mtu(), "transport_wireguard_ready");
            Ok(Arc::new(transport))
        }
    }
}
