//! UDP relay for associated clients.
//!
//! Every `(client, destination)` pair gets its own tunnel UDP socket. The
//! local address a pair used last time is asked for again so the remote
//! side sees a stable source; if the stack reports the port as taken an
//! ephemeral one is used instead. Remembered addresses last as long as the
//! association that produced them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::association::{Associated, AssociationTable};
use super::flow::{FlowTracker, Protocol};
use super::protocol::{encode_datagram, Datagram, TargetAddr};
use crate::context::Context;
use crate::netstack::{DatagramConn, Dialer};
use crate::resolver::Resolver;

const MAX_DATAGRAM: usize = 65535;
const EXCHANGE_QUEUE: usize = 64;

type ExchangeKey = (SocketAddr, TargetAddr);

#[derive(Debug, Clone, Copy)]
struct LastLocal {
    association: u64,
    addr: SocketAddr,
}

/// Bind a tunnel UDP socket, reporting stack port conflicts as
/// `ErrorKind::AddrInUse` like a host socket would.
pub async fn dial_udp(
    dialer: &dyn Dialer,
    local: Option<SocketAddr>,
    remote: SocketAddr,
) -> io::Result<Box<dyn DatagramConn>> {
    dialer.dial_udp(local, remote).await.map_err(io::Error::from)
}

pub struct DatagramHandler {
    associations: Arc<AssociationTable>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    flows: Arc<FlowTracker>,
    idle_timeout: Duration,
    exchanges: DashMap<ExchangeKey, mpsc::Sender<Vec<u8>>>,
    last_local: DashMap<ExchangeKey, LastLocal>,
}

impl DatagramHandler {
    pub fn new(
        associations: Arc<AssociationTable>,
        resolver: Arc<dyn Resolver>,
        dialer: Arc<dyn Dialer>,
        flows: Arc<FlowTracker>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            associations,
            resolver,
            dialer,
            flows,
            idle_timeout,
            exchanges: DashMap::new(),
            last_local: DashMap::new(),
        })
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.len()
    }

    /// Local addresses kept for reuse by later exchanges.
    pub fn remembered_locals(&self) -> usize {
        self.last_local.len()
    }

    /// Receive client datagrams on `socket` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = ?e.to_string(), "udp_relay_recv_failed");
                        continue;
                    }
                },
            };
            self.handle(&socket, src, &buf[..n]);
        }
    }

    fn handle(self: &Arc<Self>, socket: &Arc<UdpSocket>, src: SocketAddr, packet: &[u8]) {
        let Some(association) = self.associations.lookup(src) else {
            debug!(src = ?src, "udp_datagram_unassociated");
            return;
        };
        let datagram = match Datagram::decode(packet) {
            Ok(d) => d,
            Err(e) => {
                debug!(src = ?src, error = ?e.to_string(), "udp_datagram_malformed");
                return;
            }
        };
        if datagram.frag != 0 {
            debug!(src = ?src, frag = datagram.frag, "udp_fragment_dropped");
            return;
        }

        let key = (src, datagram.target.clone());
        if let Some(tx) = self.exchanges.get(&key).map(|entry| entry.clone()) {
            match tx.try_send(datagram.payload.to_vec()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(src = ?src, target = %datagram.target, "udp_exchange_queue_full");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.exchanges.remove_if(&key, |_, current| current.same_channel(&tx));
                }
            }
        }

        let (tx, rx) = mpsc::channel(EXCHANGE_QUEUE);
        // Cannot fail: the receiver is still in hand.
        let _ = tx.try_send(datagram.payload.to_vec());
        self.exchanges.insert(key.clone(), tx.clone());
        tokio::spawn(Arc::clone(self).exchange(Arc::clone(socket), key, tx, rx, association));
    }

    async fn exchange(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        key: ExchangeKey,
        tx: mpsc::Sender<Vec<u8>>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        association: Associated,
    ) {
        let (client, target) = (key.0, key.1.clone());
        let flow = self.flows.open(Protocol::Udp, client, target.to_string());

        match self.open(&key, association.id).await {
            Ok(conn) => {
                flow.activate(conn.peer_addr());
                self.remember_local(&key, &association, conn.local_addr());
                self.pump(&socket, client, &target, conn.as_ref(), &mut rx, &association.liveness)
                    .await;
            }
            Err(e) => warn!(client = ?client, target = %target, error = ?e.to_string(), "udp_exchange_dial_failed"),
        }

        flow.closing();
        self.exchanges
            .remove_if(&key, |_, current| current.same_channel(&tx));
    }

    /// Record `addr` for `key`. The first record an association makes for a
    /// key starts a task that forgets it once the association ends.
    fn remember_local(self: &Arc<Self>, key: &ExchangeKey, association: &Associated, addr: SocketAddr) {
        let entry = LastLocal {
            association: association.id,
            addr,
        };
        let fresh = match self.last_local.insert(key.clone(), entry) {
            Some(previous) => previous.association != association.id,
            None => true,
        };
        if !fresh {
            return;
        }
        let this = Arc::clone(self);
        let key = key.clone();
        let association = association.clone();
        tokio::spawn(async move {
            association.liveness.cancelled().await;
            this.last_local
                .remove_if(&key, |_, current| current.association == association.id);
        });
    }

    async fn open(&self, key: &ExchangeKey, association: u64) -> io::Result<Box<dyn DatagramConn>> {
        let target = &key.1;
        let (_ctx, ip) = self
            .resolver
            .resolve(&Context::background(), &target.host())
            .await
            .map_err(io::Error::other)?;
        let remote = SocketAddr::new(ip, target.port());

        let previous = self
            .last_local
            .get(key)
            .filter(|entry| entry.association == association)
            .map(|entry| entry.addr);
        let conn = match dial_udp(self.dialer.as_ref(), previous, remote).await {
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && previous.is_some() => {
                debug!(local = ?previous, remote = ?remote, "udp_local_addr_busy_retrying");
                dial_udp(self.dialer.as_ref(), None, remote).await?
            }
            other => other?,
        };
        debug!(client = ?key.0, local = ?conn.local_addr(), remote = ?remote, "udp_exchange_opened");
        Ok(conn)
    }

    async fn pump(
        &self,
        socket: &UdpSocket,
        client: SocketAddr,
        target: &TargetAddr,
        conn: &dyn DatagramConn,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        liveness: &CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = liveness.cancelled() => break,
                _ = &mut idle => {
                    debug!(client = ?client, target = %target, "udp_exchange_idle");
                    break;
                }
                outbound = rx.recv() => {
                    let Some(payload) = outbound else { break };
                    if let Err(e) = conn.send(&payload).await {
                        debug!(error = ?e.to_string(), "udp_exchange_send_failed");
                        break;
                    }
                }
                inbound = conn.recv(&mut buf) => {
                    let n = match inbound {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = ?e.to_string(), "udp_exchange_recv_failed");
                            break;
                        }
                    };
                    let reply = encode_datagram(target, &buf[..n]);
                    if let Err(e) = socket.send_to(&reply, client).await {
                        debug!(error = ?e.to_string(), "udp_reply_send_failed");
                    }
                }
            }
            idle.as_mut().reset(tokio::time::Instant::now() + self.idle_timeout);
        }
    }
}
