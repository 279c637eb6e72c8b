use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use smoltcp::iface::{Config, Interface, SocketSet};
use smoltcp::socket::tcp::{self, Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::device::VirtualDevice;
use super::*;
use crate::error::ContextError;
use crate::transport::memory::{self, MemoryPeer};

const LOCAL_V4: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);

fn stack() -> (TunnelStack, MemoryPeer) {
    let (transport, peer) = memory::pair(1280);
    let addrs = StackAddrs {
        ipv4: LOCAL_V4,
        ipv6: None,
    };
    (TunnelStack::new(Arc::new(transport), addrs, 1280), peer)
}

fn checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut odd: Option<u8> = None;
    for chunk in chunks {
        for &b in chunk.iter() {
            match odd.take() {
                Some(hi) => sum += u32::from(u16::from_be_bytes([hi, b])),
                None => odd = Some(b),
            }
        }
    }
    if let Some(hi) = odd {
        sum += u32::from(u16::from_be_bytes([hi, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv4_udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let udp_len = (8 + payload.len()) as u16;
    let total_len = 20 + udp_len;

    let mut ip = vec![0x45, 0, 0, 0, 0, 0, 0x40, 0, 64, 17, 0, 0];
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip.extend_from_slice(&src.ip().octets());
    ip.extend_from_slice(&dst.ip().octets());
    let ip_sum = checksum(&[&ip]);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let mut udp = Vec::with_capacity(udp_len as usize);
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&udp_len.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let mut pseudo = Vec::new();
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.extend_from_slice(&[0, 17]);
    pseudo.extend_from_slice(&udp_len.to_be_bytes());
    let udp_sum = match checksum(&[&pseudo, &udp]) {
        0 => 0xffff,
        s => s,
    };
    udp[6..8].copy_from_slice(&udp_sum.to_be_bytes());

    ip.extend_from_slice(&udp);
    Bytes::from(ip)
}

struct Parsed {
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    transport: Vec<u8>,
}

fn parse_ipv4(packet: &[u8]) -> Parsed {
    assert_eq!(packet[0] >> 4, 4, "IPv4 packet expected");
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    Parsed {
        protocol: packet[9],
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        transport: packet[ihl..].to_vec(),
    }
}

/// A host behind the tunnel: its own smoltcp interface at `addr`, echoing
/// every byte it receives and closing once the stack closes its side.
fn spawn_echo_host(mut peer: MemoryPeer, addr: SocketAddrV4) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let now = move || smoltcp::time::Instant::from_micros(started.elapsed().as_micros() as i64);
        let mut device = VirtualDevice::new(1280);
        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = 7;
        let mut iface = Interface::new(config, &mut device, now());
        iface.update_ip_addrs(|ips| {
            let _ = ips.push(IpCidr::new(IpAddress::Ipv4(*addr.ip()), 32));
        });
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));

        let mut sockets = SocketSet::new(vec![]);
        let mut listener = TcpSocket::new(
            TcpSocketBuffer::new(vec![0u8; 16 * 1024]),
            TcpSocketBuffer::new(vec![0u8; 16 * 1024]),
        );
        listener.listen(addr.port()).expect("listen");
        let handle = sockets.add(listener);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            while let Ok(packet) = peer.from_stack.try_recv() {
                device.inbound.push_back(packet);
            }
            let _ = iface.poll(now(), &mut device, &mut sockets);

            let sock = sockets.get_mut::<TcpSocket>(handle);
            if sock.can_recv() {
                let _ = sock.recv(|buf| {
                    pending.extend_from_slice(buf);
                    (buf.len(), ())
                });
            }
            if !pending.is_empty() && sock.can_send() {
                if let Ok(n) = sock.send_slice(&pending) {
                    pending.drain(..n);
                }
            }
            if pending.is_empty() && sock.state() == tcp::State::CloseWait {
                sock.close();
            }

            let _ = iface.poll(now(), &mut device, &mut sockets);
            while let Some(packet) = device.outbound.pop_front() {
                if peer.to_stack.send(packet).is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}

async fn wait_for_tcp_release(stack: &TunnelStack) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while stack.tcp_sockets() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tcp socket still held by the stack"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_packet(peer: &mut MemoryPeer) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), peer.from_stack.recv())
        .await
        .expect("packet within deadline")
        .expect("transport open")
}

#[tokio::test]
async fn explicit_udp_port_conflict_reports_addr_in_use() {
    let (stack, _peer) = stack();
    let local: SocketAddr = "172.16.0.2:5353".parse().expect("local");
    let remote: SocketAddr = "10.0.0.53:53".parse().expect("remote");

    let first = stack.bind_udp(Some(local), remote).await.expect("first bind");
    assert_eq!(first.local_addr(), local);

    let err = stack
        .bind_udp(Some(local), remote)
        .await
        .err()
        .expect("second bind must fail");
    assert!(matches!(err, StackError::PortInUse(addr) if addr == local));
    let host: io::Error = err.into();
    assert_eq!(host.kind(), io::ErrorKind::AddrInUse);
}

#[tokio::test]
async fn ephemeral_udp_binds_get_distinct_ports() {
    let (stack, _peer) = stack();
    let remote: SocketAddr = "10.0.0.53:53".parse().expect("remote");
    let a = stack.bind_udp(None, remote).await.expect("bind a");
    let b = stack.bind_udp(None, remote).await.expect("bind b");
    assert_ne!(a.local_addr().port(), b.local_addr().port());
    for conn in [&a, &b] {
        let port = conn.local_addr().port();
        assert!((LOCAL_PORT_START..=LOCAL_PORT_END).contains(&port));
        assert_eq!(conn.local_addr().ip(), std::net::IpAddr::V4(LOCAL_V4));
    }
}

#[tokio::test]
async fn released_udp_port_can_be_bound_again() {
    let (stack, _peer) = stack();
    let local: SocketAddr = "0.0.0.0:6000".parse().expect("local");
    let remote: SocketAddr = "10.0.0.53:53".parse().expect("remote");
    let conn = stack.bind_udp(Some(local), remote).await.expect("bind");
    drop(conn);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match stack.bind_udp(Some(local), remote).await {
            Ok(conn) => {
                assert_eq!(conn.local_addr().port(), 6000);
                break;
            }
            Err(StackError::PortInUse(_)) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("rebind failed: {e}"),
        }
    }
}

#[tokio::test]
async fn udp_datagrams_cross_the_transport() {
    let (stack, mut peer) = stack();
    let server = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 53), 53);
    let conn = stack
        .bind_udp(None, SocketAddr::V4(server))
        .await
        .expect("bind");
    let local = match conn.local_addr() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("IPv4 local expected"),
    };

    conn.send(b"query").await.expect("send");
    let out = parse_ipv4(&next_packet(&mut peer).await);
    assert_eq!(out.protocol, 17);
    assert_eq!(out.src, LOCAL_V4);
    assert_eq!(out.dst, *server.ip());
    assert_eq!(u16::from_be_bytes([out.transport[2], out.transport[3]]), 53);
    assert_eq!(&out.transport[8..], b"query");

    let stranger = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 53);
    peer.to_stack
        .send(ipv4_udp_packet(stranger, local, b"spoofed"))
        .expect("inject stranger");
    peer.to_stack
        .send(ipv4_udp_packet(server, local, b"answer"))
        .expect("inject answer");

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), conn.recv(&mut buf))
        .await
        .expect("reply within deadline")
        .expect("recv");
    assert_eq!(&buf[..n], b"answer");
}

#[tokio::test]
async fn tcp_dial_gives_up_at_deadline() {
    let (stack, mut peer) = stack();
    let remote: SocketAddr = "10.0.0.80:80".parse().expect("remote");
    let ctx = Context::background().with_timeout(Duration::from_millis(200));

    let err = stack
        .connect_tcp(&ctx, remote)
        .await
        .err()
        .expect("no peer answers the SYN");
    assert!(matches!(
        err,
        StackError::Context(ContextError::DeadlineExceeded)
    ));

    let syn = parse_ipv4(&next_packet(&mut peer).await);
    assert_eq!(syn.protocol, 6);
    assert_eq!(syn.dst, Ipv4Addr::new(10, 0, 0, 80));
    assert_eq!(u16::from_be_bytes([syn.transport[2], syn.transport[3]]), 80);
    assert_ne!(syn.transport[13] & 0x02, 0, "SYN flag set");
}

#[tokio::test]
async fn ipv6_target_needs_ipv6_address() {
    let (stack, _peer) = stack();
    let remote: SocketAddr = "[2001:db8::1]:53".parse().expect("remote");
    let err = stack.bind_udp(None, remote).await.err().expect("no IPv6");
    assert!(matches!(err, StackError::FamilyUnavailable { .. }));
}

#[tokio::test]
async fn foreign_local_address_is_rejected() {
    let (stack, _peer) = stack();
    let local: SocketAddr = "10.9.9.9:0".parse().expect("local");
    let remote: SocketAddr = "10.0.0.53:53".parse().expect("remote");
    let err = stack.bind_udp(Some(local), remote).await.err().expect("foreign");
    assert!(matches!(err, StackError::AddrNotAvailable(addr) if addr == local));
}

#[tokio::test]
async fn tcp_stream_echoes_and_releases_its_socket() {
    let (stack, peer) = stack();
    let server = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 80), 7);
    let host = spawn_echo_host(peer, server);

    let ctx = Context::background().with_timeout(Duration::from_secs(5));
    let conn = stack
        .connect_tcp(&ctx, SocketAddr::V4(server))
        .await
        .expect("handshake completes");
    assert_eq!(conn.peer_addr(), SocketAddr::V4(server));
    assert_eq!(conn.local_addr().ip(), std::net::IpAddr::V4(LOCAL_V4));
    assert_eq!(stack.tcp_sockets(), 1);

    let mut payload = vec![0u8; 3 * STREAM_BUF / 2 + 1234];
    StdRng::seed_from_u64(11).fill_bytes(&mut payload);
    let (mut reader, mut writer) = tokio::io::split(conn);
    let sent = payload.clone();
    let write = tokio::spawn(async move {
        writer.write_all(&sent).await.expect("write");
        writer
    });

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut echoed))
        .await
        .expect("echo within deadline")
        .expect("read");
    assert_eq!(echoed, payload);

    let writer = write.await.expect("writer task");
    drop(writer);
    drop(reader);
    wait_for_tcp_release(&stack).await;
    host.abort();
}

#[tokio::test]
async fn tcp_dial_without_deadline_still_times_out() {
    let (transport, _peer) = memory::pair(1280);
    let addrs = StackAddrs {
        ipv4: LOCAL_V4,
        ipv6: None,
    };
    let stack = TunnelStack::with_connect_timeout(
        Arc::new(transport),
        addrs,
        1280,
        Duration::from_millis(300),
    );
    let remote: SocketAddr = "10.0.0.80:80".parse().expect("remote");

    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(3),
        stack.connect_tcp(&Context::background(), remote),
    )
    .await
    .expect("dial gives up on its own")
    .err()
    .expect("nobody answers the SYN");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(matches!(err, StackError::TimedOut(addr) if addr == remote));
    assert_eq!(io::Error::from(err).kind(), io::ErrorKind::TimedOut);
    wait_for_tcp_release(&stack).await;
}
