use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::PacketTransport;

/// In-process transport; the peer end sees every packet sent here and can
/// inject packets back.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    mtu: usize,
}

pub struct MemoryPeer {
    pub from_stack: mpsc::UnboundedReceiver<Bytes>,
    pub to_stack: mpsc::UnboundedSender<Bytes>,
}

pub fn pair(mtu: usize) -> (MemoryTransport, MemoryPeer) {
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: up_tx,
            rx: Mutex::new(down_rx),
            mtu,
        },
        MemoryPeer {
            from_stack: up_rx,
            to_stack: down_tx,
        },
    )
}

#[async_trait]
impl PacketTransport for MemoryTransport {
    async fn send_packet(&self, packet: Bytes) -> io::Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory peer dropped"))
    }

    async fn recv_packet(&self) -> io::Result<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "memory peer dropped"))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
