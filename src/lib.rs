// tunplane library crate
//
// The tunnel data plane: a userspace TCP/IP stack over a packet transport,
// tunnel-side DNS, the SOCKS5 front-end, and the native TUN bridge.

pub mod cli;
pub mod config;
pub mod congestion;
pub mod context;
pub mod device;
pub mod error;
pub mod logging;
pub mod netstack;
pub mod resolver;
pub mod socks;
pub mod transport;
pub mod tun_bridge;
