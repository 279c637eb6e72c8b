//! Hostname resolution through the tunnel.
//!
//! Queries go to the configured DNS servers over UDP sockets opened on the
//! tunnel stack, so lookups never leak to the host resolver.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{ResolveCause, ResolveError};
use crate::netstack::Dialer;

pub mod wire;

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(15);
const RESPONSE_BUF: usize = 1500;

/// Name resolution used by the SOCKS front-end.
///
/// Returns the address together with the context that should govern the
/// subsequent dial: a child of `ctx` carrying the resolver's own deadline,
/// or a plain child when `host` was already an IP literal.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, ctx: &Context, host: &str) -> Result<(Context, IpAddr), ResolveError>;
}

/// Strip surrounding brackets and any CIDR suffix.
pub fn normalize_host(host: &str) -> &str {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.split('/').next().unwrap_or(unbracketed)
}

pub fn parse_literal(host: &str) -> Option<IpAddr> {
    normalize_host(host).parse().ok()
}

/// Prefer the first IPv4 answer, otherwise the first answer of any family.
pub fn select_ipv4_preferred(ips: &[IpAddr]) -> Option<IpAddr> {
    ips.iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| ips.first())
        .copied()
}

pub struct TunnelDnsResolver {
    servers: Vec<IpAddr>,
    dialer: Arc<dyn Dialer>,
    query_timeout: Duration,
    cache: Mutex<HashMap<String, (Instant, Vec<IpAddr>)>>,
    next_id: AtomicU16,
}

impl TunnelDnsResolver {
    pub fn new(dialer: Arc<dyn Dialer>, servers: Vec<IpAddr>, query_timeout: Duration) -> Self {
        let mut unique = Vec::with_capacity(servers.len());
        for server in servers {
            if !unique.contains(&server) {
                unique.push(server);
            }
        }
        Self {
            servers: unique,
            dialer,
            query_timeout,
            cache: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(rand::random()),
        }
    }

    pub fn servers(&self) -> &[IpAddr] {
        &self.servers
    }

    fn cache_get(&self, key: &str) -> Option<Vec<IpAddr>> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(key) {
            Some((expires, ips)) if *expires > Instant::now() => Some(ips.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, ips: Vec<IpAddr>) {
        if let Ok(mut cache) = self.cache.lock() {
            let now = Instant::now();
            cache.retain(|_, (expires, _)| *expires > now);
            cache.insert(key, (now + CACHE_TTL, ips));
        }
    }

    async fn lookup(&self, ctx: &Context, host: &str) -> Result<Vec<IpAddr>, ResolveCause> {
        let mut last_err = None;
        let mut resolved = Vec::new();
        for qtype in [wire::QTYPE_A, wire::QTYPE_AAAA] {
            for server in &self.servers {
                match ctx.run(self.query(*server, host, qtype)).await? {
                    Ok(ips) if !ips.is_empty() => {
                        resolved.extend(ips);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(host = host, server = ?server, qtype = qtype, error = ?e.to_string(), "dns_query_failed");
                        last_err = Some(e);
                    }
                }
            }
            if !resolved.is_empty() {
                break;
            }
        }

        if resolved.is_empty() {
            Err(last_err.unwrap_or(ResolveCause::NotFound))
        } else {
            Ok(wire::dedup_ips(resolved))
        }
    }

    async fn query(&self, server: IpAddr, host: &str, qtype: u16) -> Result<Vec<IpAddr>, ResolveCause> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = wire::build_query(host, qtype, id)?;
        let conn = self
            .dialer
            .dial_udp(None, SocketAddr::new(server, DNS_PORT))
            .await
            .map_err(std::io::Error::from)?;
        conn.send(&query).await?;

        let mut buf = vec![0u8; RESPONSE_BUF];
        loop {
            let n = conn.recv(&mut buf).await?;
            // Late answers to an earlier query on a recycled port.
            if wire::response_id(&buf[..n]) != Some(id) {
                continue;
            }
            return wire::parse_response(&buf[..n], id, qtype);
        }
    }
}

#[async_trait]
impl Resolver for TunnelDnsResolver {
    async fn resolve(&self, ctx: &Context, host: &str) -> Result<(Context, IpAddr), ResolveError> {
        if let Some(ip) = parse_literal(host) {
            return Ok((ctx.child(), ip));
        }

        let name = normalize_host(host).trim_end_matches('.').to_ascii_lowercase();
        let derived = ctx.with_timeout(self.query_timeout);
        if let Some(ips) = self.cache_get(&name) {
            if let Some(ip) = select_ipv4_preferred(&ips) {
                debug!(host = %name, ip = ?ip, "dns_cache_hit");
                return Ok((derived, ip));
            }
        }
        if self.servers.is_empty() {
            return Err(ResolveError::new(host, ResolveCause::NoServers));
        }

        let ips = self
            .lookup(&derived, &name)
            .await
            .map_err(|cause| ResolveError::new(host, cause))?;
        let ip = select_ipv4_preferred(&ips)
            .ok_or_else(|| ResolveError::new(host, ResolveCause::NotFound))?;
        debug!(host = %name, ip = ?ip, answers = ips.len(), "dns_resolved");
        self.cache_put(name, ips);
        Ok((derived, ip))
    }
}

#[cfg(test)]
mod tests;
