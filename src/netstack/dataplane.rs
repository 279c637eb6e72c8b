use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{self, Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::socket::udp::{
    PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata, Socket as SmolUdpSocket,
};
use smoltcp::wire::{IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

use super::device::VirtualDevice;
use super::{
    StackAddrs, StackRequest, TcpRequest, UdpRequest, LOCAL_PORT_END, LOCAL_PORT_START,
    STREAM_BUF, TCP_SOCKET_BUF, UDP_PACKET_CAP, UDP_PACKET_SLOTS,
};
use crate::device::AddressFamily;
use crate::error::StackError;
use crate::transport::PacketTransport;

const IDLE_TICK: Duration = Duration::from_millis(100);
const CLOSE_LINGER: Duration = Duration::from_secs(5);
const REMOTE_PENDING_MAX_BYTES: usize = 2 * 1024 * 1024;

struct TcpEntry {
    handle: SocketHandle,
    local: SocketAddr,
    remote: SocketAddr,
    /// Present until the virtual TCP handshake completes.
    reply: Option<oneshot::Sender<Result<SocketAddr, StackError>>>,
    dial_deadline: Instant,
    /// Dropped once the peer finished sending, which the conn reads as EOF.
    to_conn: Option<mpsc::Sender<Bytes>>,
    from_conn: mpsc::Receiver<Bytes>,
    pending_to_remote: VecDeque<Bytes>,
    pending_remote_bytes: usize,
    pending_to_conn: Option<Bytes>,
    write_closed: bool,
    fin_sent: bool,
    closing_since: Option<Instant>,
}

struct UdpEntry {
    handle: SocketHandle,
    local: SocketAddr,
    remote: SocketAddr,
    to_conn: mpsc::Sender<Bytes>,
    from_conn: mpsc::Receiver<Bytes>,
}

enum Step {
    Keep { progress: bool },
    Remove,
}

enum Wake {
    Request(Option<StackRequest>),
    Packet(Option<Bytes>),
    Notified,
    Timer,
}

pub(crate) struct Dataplane {
    addrs: StackAddrs,
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    req_rx: mpsc::Receiver<StackRequest>,
    inbound_rx: mpsc::Receiver<Bytes>,
    outbound_tx: mpsc::Sender<Bytes>,
    loop_notify: Arc<Notify>,
    started: Instant,
    next_port: u16,
    tcp_ports: HashSet<u16>,
    udp_ports: HashSet<u16>,
    connect_timeout: Duration,
    tcp_sockets: Arc<AtomicUsize>,
    tcp: Vec<TcpEntry>,
    udp: Vec<UdpEntry>,
}

impl Dataplane {
    pub fn new(
        addrs: StackAddrs,
        mtu: usize,
        req_rx: mpsc::Receiver<StackRequest>,
        inbound_rx: mpsc::Receiver<Bytes>,
        outbound_tx: mpsc::Sender<Bytes>,
        loop_notify: Arc<Notify>,
        connect_timeout: Duration,
        tcp_sockets: Arc<AtomicUsize>,
    ) -> Self {
        let started = Instant::now();
        let mut device = VirtualDevice::new(mtu);
        let mut config = Config::new(smoltcp::wire::HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, smoltcp::time::Instant::from_micros(0));
        iface.update_ip_addrs(|ips| {
            let _ = ips.push(IpCidr::new(IpAddress::Ipv4(addrs.ipv4), 32));
            if let Some(v6) = addrs.ipv6 {
                let _ = ips.push(IpCidr::new(IpAddress::Ipv6(v6), 128));
            }
        });
        // Everything routes into the tunnel; the gateway address is never
        // resolved on a Medium::Ip device.
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(std::net::Ipv4Addr::new(0, 0, 0, 1));
        if addrs.ipv6.is_some() {
            let _ = iface
                .routes_mut()
                .add_default_ipv6_route(std::net::Ipv6Addr::LOCALHOST);
        }

        Self {
            addrs,
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            req_rx,
            inbound_rx,
            outbound_tx,
            loop_notify,
            started,
            next_port: LOCAL_PORT_START,
            tcp_ports: HashSet::new(),
            udp_ports: HashSet::new(),
            connect_timeout,
            tcp_sockets,
            tcp: Vec::new(),
            udp: Vec::new(),
        }
    }

    fn now(&self) -> smoltcp::time::Instant {
        smoltcp::time::Instant::from_micros(self.started.elapsed().as_micros() as i64)
    }

    pub async fn run(mut self) {
        loop {
            loop {
                match self.req_rx.try_recv() {
                    Ok(req) => self.accept(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("tunnel_stack_dropped");
                        return;
                    }
                }
            }
            loop {
                match self.inbound_rx.try_recv() {
                    Ok(packet) => self.device.inbound.push_back(packet),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("tunnel_transport_closed");
                        return;
                    }
                }
            }

            let now = self.now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
            let tcp_progress = self.service_tcp();
            let udp_progress = self.service_udp();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
            while let Some(packet) = self.device.outbound.pop_front() {
                if self.outbound_tx.send(packet).await.is_err() {
                    warn!("tunnel_transport_writer_gone");
                    return;
                }
            }

            if tcp_progress || udp_progress || !self.device.inbound.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            let mut delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(IDLE_TICK);
            if self.tcp.iter().any(|e| e.closing_since.is_some() || e.reply.is_some()) {
                delay = delay.min(IDLE_TICK);
            }

            let wake = tokio::select! {
                req = self.req_rx.recv() => Wake::Request(req),
                packet = self.inbound_rx.recv() => Wake::Packet(packet),
                _ = self.loop_notify.notified() => Wake::Notified,
                _ = tokio::time::sleep(delay) => Wake::Timer,
            };
            match wake {
                Wake::Request(Some(req)) => self.accept(req),
                Wake::Request(None) => {
                    debug!("tunnel_stack_dropped");
                    return;
                }
                Wake::Packet(Some(packet)) => self.device.inbound.push_back(packet),
                Wake::Packet(None) => {
                    warn!("tunnel_transport_closed");
                    return;
                }
                Wake::Notified | Wake::Timer => {}
            }
        }
    }

    fn accept(&mut self, req: StackRequest) {
        match req {
            StackRequest::Tcp(req) => self.accept_tcp(req),
            StackRequest::Udp(req) => self.accept_udp(req),
        }
    }

    fn local_ip_for(&self, remote: SocketAddr) -> Result<IpAddr, StackError> {
        self.addrs
            .for_remote(remote.ip())
            .ok_or(StackError::FamilyUnavailable {
                family: AddressFamily::Ipv6,
                target: remote,
            })
    }

    fn accept_tcp(&mut self, req: TcpRequest) {
        let remote = unmap(req.remote);
        let local_ip = match self.local_ip_for(remote) {
            Ok(ip) => ip,
            Err(e) => {
                let _ = req.reply.send(Err(e));
                return;
            }
        };
        let Some(port) = allocate_port(&mut self.next_port, &mut self.tcp_ports) else {
            let _ = req.reply.send(Err(StackError::PortsExhausted));
            return;
        };
        let local = SocketAddr::new(local_ip, port);

        let mut sock = TcpSocket::new(
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
        );
        sock.set_nagle_enabled(false);
        sock.set_ack_delay(None);
        let listen = IpListenEndpoint {
            addr: Some(ip_to_smoltcp(local_ip)),
            port,
        };
        if let Err(e) = sock.connect(self.iface.context(), endpoint(remote), listen) {
            debug!(remote = ?remote, error = ?e, "tcp_connect_rejected");
            self.tcp_ports.remove(&port);
            let _ = req.reply.send(Err(StackError::AddrNotAvailable(local)));
            return;
        }

        let handle = self.sockets.add(sock);
        trace!(local = ?local, remote = ?remote, "tcp_dial_started");
        self.tcp.push(TcpEntry {
            handle,
            local,
            remote,
            reply: Some(req.reply),
            dial_deadline: Instant::now() + self.connect_timeout,
            to_conn: Some(req.to_conn),
            from_conn: req.from_conn,
            pending_to_remote: VecDeque::new(),
            pending_remote_bytes: 0,
            pending_to_conn: None,
            write_closed: false,
            fin_sent: false,
            closing_since: None,
        });
        self.tcp_sockets.fetch_add(1, Ordering::Relaxed);
    }

    fn accept_udp(&mut self, req: UdpRequest) {
        match self.bind_udp(req.local, unmap(req.remote)) {
            Ok((handle, local)) => {
                if req.reply.send(Ok(local)).is_err() {
                    self.sockets.remove(handle);
                    self.udp_ports.remove(&local.port());
                    return;
                }
                trace!(local = ?local, remote = ?req.remote, "udp_bound");
                self.udp.push(UdpEntry {
                    handle,
                    local,
                    remote: unmap(req.remote),
                    to_conn: req.to_conn,
                    from_conn: req.from_conn,
                });
            }
            Err(e) => {
                debug!(local = ?req.local, remote = ?req.remote, error = %e, "udp_bind_failed");
                let _ = req.reply.send(Err(e));
            }
        }
    }

    fn bind_udp(
        &mut self,
        requested: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<(SocketHandle, SocketAddr), StackError> {
        let local_ip = self.local_ip_for(remote)?;
        let requested = requested.map(unmap);
        if let Some(addr) = requested {
            let ip = addr.ip();
            let same_family = ip.is_ipv4() == local_ip.is_ipv4();
            if !ip.is_unspecified() && (!self.addrs.contains(ip) || !same_family) {
                return Err(StackError::AddrNotAvailable(addr));
            }
        }

        let port = match requested.map(|a| a.port()).filter(|p| *p != 0) {
            Some(port) => {
                if !self.udp_ports.insert(port) {
                    return Err(StackError::PortInUse(SocketAddr::new(local_ip, port)));
                }
                port
            }
            None => allocate_port(&mut self.next_port, &mut self.udp_ports)
                .ok_or(StackError::PortsExhausted)?,
        };
        let local = SocketAddr::new(local_ip, port);

        let rx = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_PACKET_CAP],
        );
        let tx = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_PACKET_CAP],
        );
        let mut sock = SmolUdpSocket::new(rx, tx);
        let listen = IpListenEndpoint {
            addr: Some(ip_to_smoltcp(local_ip)),
            port,
        };
        if let Err(e) = sock.bind(listen) {
            debug!(local = ?local, error = ?e, "udp_bind_rejected");
            self.udp_ports.remove(&port);
            return Err(StackError::AddrNotAvailable(local));
        }
        Ok((self.sockets.add(sock), local))
    }

    fn service_tcp(&mut self) -> bool {
        let mut progress = false;
        let mut i = 0;
        while i < self.tcp.len() {
            let entry = &mut self.tcp[i];
            let sock = self.sockets.get_mut::<TcpSocket>(entry.handle);
            match step_tcp(entry, sock) {
                Step::Keep { progress: p } => {
                    progress |= p;
                    i += 1;
                }
                Step::Remove => {
                    let entry = self.tcp.swap_remove(i);
                    self.sockets.remove(entry.handle);
                    self.tcp_ports.remove(&entry.local.port());
                    self.tcp_sockets.fetch_sub(1, Ordering::Relaxed);
                    trace!(local = ?entry.local, remote = ?entry.remote, "tcp_socket_released");
                    progress = true;
                }
            }
        }
        progress
    }

    fn service_udp(&mut self) -> bool {
        let mut progress = false;
        let mut i = 0;
        while i < self.udp.len() {
            let entry = &mut self.udp[i];
            let sock = self.sockets.get_mut::<SmolUdpSocket>(entry.handle);
            match step_udp(entry, sock) {
                Step::Keep { progress: p } => {
                    progress |= p;
                    i += 1;
                }
                Step::Remove => {
                    let entry = self.udp.swap_remove(i);
                    self.sockets.remove(entry.handle);
                    self.udp_ports.remove(&entry.local.port());
                    trace!(local = ?entry.local, "udp_socket_released");
                    progress = true;
                }
            }
        }
        progress
    }
}

fn step_tcp(entry: &mut TcpEntry, sock: &mut TcpSocket<'static>) -> Step {
    if let Some(since) = entry.closing_since {
        if !sock.is_open() || sock.state() == tcp::State::TimeWait || since.elapsed() >= CLOSE_LINGER
        {
            return Step::Remove;
        }
        return Step::Keep { progress: false };
    }

    let mut progress = false;

    if let Some(reply) = entry.reply.take() {
        if reply.is_closed() {
            debug!(remote = ?entry.remote, "tcp_dial_abandoned");
            sock.abort();
            entry.closing_since = Some(Instant::now());
            return Step::Keep { progress: true };
        }
        if sock.may_send() {
            debug!(local = ?entry.local, remote = ?entry.remote, "tcp_connected");
            if reply.send(Ok(entry.local)).is_err() {
                sock.abort();
                entry.closing_since = Some(Instant::now());
                return Step::Keep { progress: true };
            }
            progress = true;
        } else if sock.state() == tcp::State::Closed {
            let _ = reply.send(Err(StackError::ConnectionRefused(entry.remote)));
            return Step::Remove;
        } else if Instant::now() >= entry.dial_deadline {
            debug!(remote = ?entry.remote, "tcp_dial_timed_out");
            let _ = reply.send(Err(StackError::TimedOut(entry.remote)));
            sock.abort();
            entry.closing_since = Some(Instant::now());
            return Step::Keep { progress: true };
        } else {
            entry.reply = Some(reply);
            return Step::Keep { progress: false };
        }
    }

    if !sock.is_open() {
        // Reset by the peer: conn writers see a closed pipe, readers EOF.
        entry.from_conn.close();
        entry.to_conn = None;
        return Step::Remove;
    }

    while !entry.write_closed && entry.pending_remote_bytes < REMOTE_PENDING_MAX_BYTES {
        match entry.from_conn.try_recv() {
            Ok(data) => {
                entry.pending_remote_bytes += data.len();
                entry.pending_to_remote.push_back(data);
                progress = true;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => entry.write_closed = true,
        }
    }

    while sock.can_send() {
        let Some(front) = entry.pending_to_remote.front_mut() else {
            break;
        };
        match sock.send_slice(front.as_ref()) {
            Ok(sent) if sent == front.len() => {
                entry.pending_remote_bytes = entry.pending_remote_bytes.saturating_sub(sent);
                let _ = entry.pending_to_remote.pop_front();
                progress = true;
            }
            Ok(sent) => {
                let _ = front.split_to(sent);
                entry.pending_remote_bytes = entry.pending_remote_bytes.saturating_sub(sent);
                progress |= sent > 0;
                break;
            }
            Err(_) => break,
        }
    }

    if entry.write_closed && entry.pending_to_remote.is_empty() && !entry.fin_sent {
        sock.close();
        entry.fin_sent = true;
        progress = true;
    }

    if entry.pending_to_conn.is_none() && sock.can_recv() {
        if let Ok(Some(chunk)) = sock.recv(|buf| {
            let n = buf.len().min(STREAM_BUF);
            if n == 0 {
                (0, None)
            } else {
                (n, Some(Bytes::copy_from_slice(&buf[..n])))
            }
        }) {
            entry.pending_to_conn = Some(chunk);
            progress = true;
        }
    }

    if let Some(chunk) = entry.pending_to_conn.take() {
        match entry.to_conn.as_ref() {
            Some(tx) => match tx.try_send(chunk) {
                Ok(()) => progress = true,
                Err(TrySendError::Full(chunk)) => entry.pending_to_conn = Some(chunk),
                Err(TrySendError::Closed(_)) => entry.to_conn = None,
            },
            None => {}
        }
    }

    if entry.to_conn.is_some()
        && entry.pending_to_conn.is_none()
        && !sock.may_recv()
        && !sock.can_recv()
    {
        trace!(remote = ?entry.remote, "tcp_peer_finished");
        entry.to_conn = None;
        progress = true;
    }

    let reader_gone = entry.to_conn.as_ref().map_or(true, |tx| tx.is_closed());
    if reader_gone && entry.write_closed && entry.pending_to_remote.is_empty() {
        if !entry.fin_sent {
            sock.close();
            entry.fin_sent = true;
        }
        entry.closing_since = Some(Instant::now());
        progress = true;
    }

    Step::Keep { progress }
}

fn step_udp(entry: &mut UdpEntry, sock: &mut SmolUdpSocket<'static>) -> Step {
    if entry.to_conn.is_closed() {
        return Step::Remove;
    }
    let mut progress = false;
    let remote = endpoint(entry.remote);

    while sock.can_send() {
        match entry.from_conn.try_recv() {
            Ok(datagram) => {
                if let Err(e) = sock.send_slice(&datagram, remote) {
                    debug!(remote = ?entry.remote, error = ?e, "udp_send_dropped");
                }
                progress = true;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return Step::Remove,
        }
    }

    while sock.can_recv() {
        let Ok((data, meta)) = sock.recv() else {
            break;
        };
        progress = true;
        if meta.endpoint != remote {
            trace!(from = ?meta.endpoint, expected = ?entry.remote, "udp_foreign_datagram_dropped");
            continue;
        }
        match entry.to_conn.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(remote = ?entry.remote, "udp_conn_backlog_dropped");
            }
            Err(TrySendError::Closed(_)) => return Step::Remove,
        }
    }

    Step::Keep { progress }
}

fn allocate_port(next: &mut u16, used: &mut HashSet<u16>) -> Option<u16> {
    let span = usize::from(LOCAL_PORT_END - LOCAL_PORT_START) + 1;
    for _ in 0..span {
        let port = *next;
        *next = if *next >= LOCAL_PORT_END {
            LOCAL_PORT_START
        } else {
            *next + 1
        };
        if used.insert(port) {
            return Some(port);
        }
    }
    None
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

pub(crate) fn ip_to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

fn endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(ip_to_smoltcp(addr.ip()), addr.port())
}

pub(crate) async fn pump_inbound(
    transport: Arc<dyn PacketTransport>,
    inbound_tx: mpsc::Sender<Bytes>,
) {
    loop {
        match transport.recv_packet().await {
            Ok(packet) => {
                if inbound_tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = ?e.to_string(), "tunnel_transport_recv_failed");
                break;
            }
        }
    }
}

pub(crate) async fn pump_outbound(
    transport: Arc<dyn PacketTransport>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) {
    while let Some(packet) = outbound_rx.recv().await {
        if let Err(e) = transport.send_packet(packet).await {
            debug!(error = ?e.to_string(), "tunnel_transport_send_failed");
        }
    }
    info!("tunnel_outbound_pump_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocation_wraps_and_skips_used() {
        let mut next = LOCAL_PORT_END;
        let mut used = HashSet::from([LOCAL_PORT_START]);
        assert_eq!(allocate_port(&mut next, &mut used), Some(LOCAL_PORT_END));
        assert_eq!(allocate_port(&mut next, &mut used), Some(LOCAL_PORT_START + 1));
    }

    #[test]
    fn mapped_ipv6_targets_become_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:53".parse().expect("mapped");
        assert_eq!(unmap(mapped), "10.0.0.1:53".parse::<SocketAddr>().expect("v4"));
    }
}
