//! Byte pump for one CONNECT flow.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const RELAY_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Idle,
    ReadError,
    WriteError,
    Stopped,
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Option<Duration>,
    stop: CancellationToken,
) -> (PumpEnd, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let end = loop {
        let read = async {
            match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf)).await.ok(),
                None => Some(reader.read(&mut buf).await),
            }
        };
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => break PumpEnd::Stopped,
            read = read => match read {
                None => break PumpEnd::Idle,
                Some(Ok(0)) => break PumpEnd::Eof,
                Some(Ok(n)) => n,
                Some(Err(_)) => break PumpEnd::ReadError,
            },
        };
        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => break PumpEnd::Stopped,
            res = writer.write_all(&buf[..n]) => res.is_ok(),
        };
        if !written {
            break PumpEnd::WriteError;
        }
    };
    stop.cancel();
    (end, writer)
}

/// Relay bytes between `client` and `tunnel` until either direction ends.
///
/// The client-to-tunnel direction runs on the calling task, the reverse
/// direction on a spawned one. Whichever stops first stops the other;
/// the tunnel leg is shut down before returning and the client leg is
/// dropped with the relay.
pub async fn relay<C, T>(client: C, tunnel: T, idle_timeout: Option<Duration>)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);
    let stop = CancellationToken::new();

    let reverse = tokio::spawn(pump(tunnel_read, client_write, idle_timeout, stop.clone()));
    let (forward_end, mut tunnel_write) = pump(client_read, tunnel_write, idle_timeout, stop.clone()).await;
    let reverse_end = match reverse.await {
        Ok((end, client_write)) => {
            drop(client_write);
            end
        }
        Err(_) => PumpEnd::Stopped,
    };

    let _ = tunnel_write.shutdown().await;
    debug!(forward = ?forward_end, reverse = ?reverse_end, "relay_finished");
}
