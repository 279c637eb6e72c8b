use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;

use super::STREAM_BUF;

/// TCP connection through the tunnel stack.
///
/// Bytes travel to and from the dataplane task over bounded channels; every
/// read or write nudges the dataplane so buffered data moves promptly.
/// Dropping the connection closes the stack socket gracefully.
pub struct TcpConn {
    rx: mpsc::Receiver<Bytes>,
    tx: PollSender<Bytes>,
    pending: Bytes,
    loop_notify: Arc<Notify>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl TcpConn {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        loop_notify: Arc<Notify>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            rx,
            tx: PollSender::new(tx),
            pending: Bytes::new(),
            loop_notify,
            local,
            peer,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pending.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.loop_notify.notify_one();
                }
                // Stack side closed: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(STREAM_BUF);
                if this.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return Poll::Ready(Err(closed()));
                }
                this.loop_notify.notify_one();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        self.loop_notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.rx.close();
        self.tx.close();
        self.loop_notify.notify_one();
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel connection closed")
}
