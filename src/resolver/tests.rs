use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::*;
use crate::error::{ContextError, StackError};
use crate::netstack::{BoxedStream, DatagramConn};

/// Answers every A query with `answer_v4` and every AAAA query with an
/// empty NOERROR response. A `None` answer leaves queries unanswered.
struct FakeDns {
    answer_v4: Option<[u8; 4]>,
    silent: bool,
    udp_dials: AtomicUsize,
}

impl FakeDns {
    fn answering(octets: [u8; 4]) -> Arc<Self> {
        Arc::new(Self {
            answer_v4: Some(octets),
            silent: false,
            udp_dials: AtomicUsize::new(0),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            answer_v4: None,
            silent: false,
            udp_dials: AtomicUsize::new(0),
        })
    }

    fn silent() -> Arc<Self> {
        Arc::new(Self {
            answer_v4: None,
            silent: true,
            udp_dials: AtomicUsize::new(0),
        })
    }

    fn dials(&self) -> usize {
        self.udp_dials.load(Ordering::SeqCst)
    }
}

fn respond(query: &[u8], answer_v4: Option<[u8; 4]>) -> Vec<u8> {
    let qtype = u16::from_be_bytes([query[query.len() - 4], query[query.len() - 3]]);
    let answer = answer_v4.filter(|_| qtype == wire::QTYPE_A);

    let mut out = Vec::new();
    out.extend_from_slice(&query[0..2]);
    out.extend_from_slice(&0x8180u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&u16::from(answer.is_some()).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&query[12..]);
    if let Some(octets) = answer {
        out.extend_from_slice(&[0xC0, 0x0C]);
        out.extend_from_slice(&wire::QTYPE_A.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&30u32.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&octets);
    }
    out
}

struct FakeDnsConn {
    answer_v4: Option<[u8; 4]>,
    silent: bool,
    replies_tx: mpsc::UnboundedSender<Vec<u8>>,
    replies_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    peer: SocketAddr,
}

#[async_trait]
impl DatagramConn for FakeDnsConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.silent {
            let _ = self.replies_tx.send(respond(buf, self.answer_v4));
        }
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let reply = self
            .replies_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn local_addr(&self) -> SocketAddr {
        "172.16.0.2:40000".parse().expect("local addr")
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Dialer for FakeDns {
    async fn dial_tcp(&self, _ctx: &Context, _remote: SocketAddr) -> Result<BoxedStream, StackError> {
        Err(StackError::StackClosed)
    }

    async fn dial_udp(
        &self,
        _local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Box<dyn DatagramConn>, StackError> {
        assert_eq!(remote.port(), DNS_PORT);
        self.udp_dials.fetch_add(1, Ordering::SeqCst);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Ok(Box::new(FakeDnsConn {
            answer_v4: self.answer_v4,
            silent: self.silent,
            replies_tx,
            replies_rx: AsyncMutex::new(replies_rx),
            peer: remote,
        }))
    }
}

fn resolver(dns: &Arc<FakeDns>) -> TunnelDnsResolver {
    TunnelDnsResolver::new(
        dns.clone(),
        vec!["10.64.0.1".parse().expect("server")],
        Duration::from_millis(300),
    )
}

#[test]
fn normalize_host_trims_cidr_and_brackets() {
    assert_eq!(normalize_host(" 10.2.0.1/32 "), "10.2.0.1");
    assert_eq!(normalize_host("[2001:db8::1]"), "2001:db8::1");
    assert_eq!(normalize_host("example.com"), "example.com");
}

#[test]
fn ipv4_answers_win() {
    let ips: Vec<IpAddr> = vec![
        "2001:db8::5".parse().expect("v6"),
        "192.0.2.5".parse().expect("v4"),
    ];
    assert_eq!(
        select_ipv4_preferred(&ips),
        Some("192.0.2.5".parse().expect("v4"))
    );
    assert_eq!(select_ipv4_preferred(&[]), None);
}

#[tokio::test]
async fn literal_addresses_skip_the_network() {
    let dns = FakeDns::answering([1, 1, 1, 1]);
    let resolver = resolver(&dns);
    let parent = Context::background();

    let (ctx, ip) = resolver.resolve(&parent, "203.0.113.9").await.expect("v4 literal");
    assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().expect("ip"));
    assert!(ctx.deadline().is_none());

    let (_, ip) = resolver.resolve(&parent, "[2001:db8::1]").await.expect("v6 literal");
    assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().expect("ip"));
    assert_eq!(dns.dials(), 0);

    parent.cancel();
    assert!(ctx.is_cancelled(), "returned context follows the caller");
}

#[tokio::test]
async fn names_resolve_through_the_tunnel() {
    let dns = FakeDns::answering([93, 184, 216, 34]);
    let resolver = resolver(&dns);

    let (ctx, ip) = resolver
        .resolve(&Context::background(), "Example.COM.")
        .await
        .expect("resolve");
    assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().expect("ip"));
    assert!(ctx.deadline().is_some());
    assert_eq!(dns.dials(), 1, "A answer ends the lookup");
}

#[tokio::test]
async fn cached_answers_avoid_a_second_round_trip() {
    let dns = FakeDns::answering([198, 51, 100, 7]);
    let resolver = resolver(&dns);
    let ctx = Context::background();

    let (_, first) = resolver.resolve(&ctx, "cdn.example").await.expect("first");
    let (_, second) = resolver.resolve(&ctx, "cdn.example").await.expect("second");
    assert_eq!(first, second);
    assert_eq!(dns.dials(), 1);
}

#[tokio::test]
async fn empty_answers_are_not_found() {
    let dns = FakeDns::empty();
    let resolver = resolver(&dns);

    let err = resolver
        .resolve(&Context::background(), "nothing.example")
        .await
        .expect_err("no records");
    assert_eq!(err.host, "nothing.example");
    assert!(matches!(err.cause, ResolveCause::NotFound));
    assert_eq!(dns.dials(), 2, "A and AAAA both asked");
}

#[tokio::test]
async fn silent_servers_hit_the_resolver_deadline() {
    let dns = FakeDns::silent();
    let resolver = resolver(&dns);

    let err = resolver
        .resolve(&Context::background(), "slow.example")
        .await
        .expect_err("deadline");
    assert!(matches!(
        err.cause,
        ResolveCause::Context(ContextError::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn caller_cancellation_stops_the_lookup() {
    let dns = FakeDns::silent();
    let resolver = TunnelDnsResolver::new(
        dns.clone(),
        vec!["10.64.0.1".parse().expect("server")],
        Duration::from_secs(30),
    );
    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(2), resolver.resolve(&ctx, "slow.example"))
        .await
        .expect("returns promptly")
        .expect_err("cancelled");
    assert!(matches!(err.cause, ResolveCause::Context(ContextError::Cancelled)));
}

#[tokio::test]
async fn no_servers_is_reported() {
    let dns = FakeDns::empty();
    let resolver = TunnelDnsResolver::new(dns.clone(), Vec::new(), DEFAULT_QUERY_TIMEOUT);
    let err = resolver
        .resolve(&Context::background(), "example.com")
        .await
        .expect_err("no servers");
    assert!(matches!(err.cause, ResolveCause::NoServers));
}
