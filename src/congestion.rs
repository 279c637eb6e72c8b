//! Congestion control for the QUIC transport.
//!
//! Every outbound QUIC connection runs BBR seeded with an initial packet size
//! derived from the remote path. IPv4 paths carry a slightly larger first
//! packet than IPv6 because the IPv6 header is 20 bytes longer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use quinn::congestion::{BbrConfig, Controller, ControllerFactory};
use quinn::TransportConfig;
use tracing::debug;

pub const INITIAL_PACKET_SIZE_IPV4: u16 = 1252;
pub const INITIAL_PACKET_SIZE_IPV6: u16 = 1232;
/// Used when the remote path is unknown.
pub const INITIAL_PACKET_SIZE_DEFAULT: u16 = 1200;

const INITIAL_WINDOW_PACKETS: u64 = 32;

pub fn initial_packet_size(remote: Option<SocketAddr>) -> u16 {
    match remote {
        Some(SocketAddr::V4(_)) => INITIAL_PACKET_SIZE_IPV4,
        Some(SocketAddr::V6(v6)) if v6.ip().to_ipv4_mapped().is_some() => INITIAL_PACKET_SIZE_IPV4,
        Some(SocketAddr::V6(_)) => INITIAL_PACKET_SIZE_IPV6,
        None => INITIAL_PACKET_SIZE_DEFAULT,
    }
}

/// BBR factory parameterized by the path's initial packet size. quinn hands
/// `build` its monotonic clock reading, which seeds the controller's timers.
#[derive(Debug, Clone, Copy)]
pub struct PathTunedBbr {
    packet_size: u16,
}

impl PathTunedBbr {
    pub fn for_remote(remote: Option<SocketAddr>) -> Self {
        Self {
            packet_size: initial_packet_size(remote),
        }
    }

    pub fn packet_size(&self) -> u16 {
        self.packet_size
    }

    pub fn initial_window(&self) -> u64 {
        INITIAL_WINDOW_PACKETS * u64::from(self.packet_size)
    }
}

impl ControllerFactory for PathTunedBbr {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        let mut config = BbrConfig::default();
        config.initial_window(self.initial_window());
        Arc::new(config).build(now, current_mtu)
    }
}

/// Install the congestion strategy on a connection's transport config.
/// Called once per connection; holds no state of its own.
pub fn apply(transport: &mut TransportConfig, remote: Option<SocketAddr>) -> PathTunedBbr {
    let bbr = PathTunedBbr::for_remote(remote);
    transport.initial_mtu(bbr.packet_size());
    transport.congestion_controller_factory(Arc::new(bbr));
    debug!(
        remote = ?remote,
        packet_size = bbr.packet_size(),
        initial_window = bbr.initial_window(),
        "congestion_bbr_applied"
    );
    bbr
}
