//! SOCKS5 front-end over the tunnel stack.
//!
//! The server takes its resolver and dialer as constructor arguments, so
//! several independent front-ends can run in one process.

pub mod association;
pub mod datagram;
pub mod flow;
pub mod protocol;
pub mod relay;
mod server;

pub use association::{Associated, AssociationGuard, AssociationTable};
pub use datagram::DatagramHandler;
pub use flow::{FlowHandle, FlowRecord, FlowState, FlowTracker, Protocol};
pub use protocol::{Credentials, TargetAddr};
pub use server::{SocksServer, SocksSettings};
