use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PacketTransport;

const WG_TIMER_TICK: Duration = Duration::from_millis(100);
const WG_BUF: usize = 65535;
const INBOUND_CAP: usize = 1024;
/// Outer IPv4 + UDP + WireGuard data header overhead.
pub const WG_OVERHEAD: usize = 80;

#[derive(Clone)]
pub struct WireGuardSettings {
    pub private_key: [u8; 32],
    pub peer_public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: SocketAddr,
    pub keepalive: Option<u16>,
    pub link_mtu: usize,
}

impl std::fmt::Debug for WireGuardSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardSettings")
            .field("endpoint", &self.endpoint)
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

pub fn decode_key(b64: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .context("invalid base64 key")?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("key must be 32 bytes, got {}", v.len()))
}

/// boringtun session over a connected UDP socket. A driver task owns the
/// receive side and the timer tick; senders encapsulate inline.
pub struct WireGuardTransport {
    udp: Arc<UdpSocket>,
    tunn: Arc<Mutex<Tunn>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    mtu: usize,
    driver: JoinHandle<()>,
}

impl WireGuardTransport {
    pub async fn connect(settings: &WireGuardSettings) -> anyhow::Result<Self> {
        let bind: SocketAddr = if settings.endpoint.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let udp = UdpSocket::bind(bind)
            .await
            .context("bind WireGuard UDP socket")?;
        udp.connect(settings.endpoint)
            .await
            .context("connect UDP to WireGuard endpoint")?;
        let udp = Arc::new(udp);

        let tunn = Tunn::new(
            StaticSecret::from(settings.private_key),
            PublicKey::from(settings.peer_public_key),
            settings.preshared_key,
            settings.keepalive,
            0,
            None,
        )
        .map_err(anyhow::Error::msg)
        .context("create WireGuard tunnel")?;
        let tunn = Arc::new(Mutex::new(tunn));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAP);
        let driver = tokio::spawn(drive(udp.clone(), tunn.clone(), inbound_tx));

        info!(endpoint = ?settings.endpoint, "wireguard_transport_started");
        Ok(Self {
            udp,
            tunn,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            mtu: settings.link_mtu.saturating_sub(WG_OVERHEAD),
            driver,
        })
    }
}

fn lock_tunn(tunn: &Mutex<Tunn>) -> std::sync::MutexGuard<'_, Tunn> {
    tunn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Copy a WriteToNetwork result out of the scratch buffer.
fn network_write(result: TunnResult<'_>) -> Option<Bytes> {
    match result {
        TunnResult::WriteToNetwork(out) => Some(Bytes::copy_from_slice(out)),
        TunnResult::Err(e) => {
            debug!(error = ?e, "wireguard_tunn_error");
            None
        }
        _ => None,
    }
}

async fn drive(udp: Arc<UdpSocket>, tunn: Arc<Mutex<Tunn>>, inbound: mpsc::Sender<Bytes>) {
    let mut udp_buf = vec![0u8; WG_BUF];
    let mut scratch = vec![0u8; WG_BUF];
    let mut tick = tokio::time::interval(WG_TIMER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Kick off the handshake instead of waiting for the first timer.
    let initiation = {
        let mut t = lock_tunn(&tunn);
        network_write(t.format_handshake_initiation(&mut scratch, false))
    };
    if let Some(out) = initiation {
        if let Err(e) = udp.send(&out).await {
            warn!(error = ?e.to_string(), "wireguard_handshake_send_failed");
        }
    }

    loop {
        tokio::select! {
            res = udp.recv(&mut udp_buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = ?e.to_string(), "udp_recv_error");
                        break;
                    }
                };
                let mut to_network = Vec::new();
                let mut to_tunnel = None;
                {
                    let mut t = lock_tunn(&tunn);
                    match t.decapsulate(None, &udp_buf[..n], &mut scratch) {
                        TunnResult::WriteToTunnelV4(plain, _)
                        | TunnResult::WriteToTunnelV6(plain, _) => {
                            to_tunnel = Some(Bytes::copy_from_slice(plain));
                        }
                        TunnResult::WriteToNetwork(out) => {
                            to_network.push(Bytes::copy_from_slice(out));
                            // Drain packets queued behind the handshake.
                            while let Some(out) = network_write(t.decapsulate(None, &[], &mut scratch)) {
                                to_network.push(out);
                            }
                        }
                        other => {
                            network_write(other);
                        }
                    }
                }
                for out in to_network {
                    if let Err(e) = udp.send(&out).await {
                        warn!(error = ?e.to_string(), "udp_send_error");
                    }
                }
                if let Some(packet) = to_tunnel {
                    if inbound.send(packet).await.is_err() {
                        debug!("wireguard_inbound_closed");
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                let out = {
                    let mut t = lock_tunn(&tunn);
                    network_write(t.update_timers(&mut scratch))
                };
                if let Some(out) = out {
                    if let Err(e) = udp.send(&out).await {
                        warn!(error = ?e.to_string(), "udp_send_error");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PacketTransport for WireGuardTransport {
    async fn send_packet(&self, packet: Bytes) -> io::Result<()> {
        let out = {
            let mut scratch = vec![0u8; packet.len() + 148];
            let mut t = lock_tunn(&self.tunn);
            network_write(t.encapsulate(&packet, &mut scratch))
        };
        if let Some(out) = out {
            self.udp.send(&out).await?;
        }
        Ok(())
    }

    async fn recv_packet(&self) -> io::Result<Bytes> {
        self.inbound.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "wireguard driver stopped")
        })
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for WireGuardTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_key_accepts_32_bytes() {
        let raw = [7u8; 32];
        let b64 = base64::engine::general_purpose::STANDARD.encode(raw);
        assert_eq!(decode_key(&format!(" {b64}\n")).expect("decode"), raw);
    }

    #[test]
    fn decode_key_rejects_short_keys() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        let err = decode_key(&b64).expect_err("short key");
        assert!(err.to_string().contains("32 bytes"));
    }
}
