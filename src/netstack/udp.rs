use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};

use super::DatagramConn;

/// Connected UDP socket on the tunnel stack. Only datagrams from the dialed
/// peer are delivered.
pub struct UdpConn {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    tx: mpsc::Sender<Bytes>,
    loop_notify: Arc<Notify>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl UdpConn {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        loop_notify: Arc<Notify>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            rx: Mutex::new(rx),
            tx,
            loop_notify,
            local,
            peer,
        }
    }
}

#[async_trait]
impl DatagramConn for UdpConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel UDP socket closed"))?;
        self.loop_notify.notify_one();
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self.rx.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel UDP socket closed")
        })?;
        // Oversized datagrams are truncated like a host socket would.
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.loop_notify.notify_one();
    }
}
