use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};

use crate::netstack::StackAddrs;
use crate::socks::{Credentials, SocksSettings};
use crate::tun_bridge::BringUp;

pub const DEFAULT_CONFIG_PATH: &str = "tunplane.json";
const MIN_MTU: u16 = 576;
const MIN_IPV6_MTU: u16 = 1280;

fn default_alpn() -> Vec<String> {
    vec!["tunplane".to_string()]
}

fn default_keepalive_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_dns_timeout_ms() -> u64 {
    5000
}

fn default_mtu() -> u16 {
    1280
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1080))
}

fn default_udp_timeout_secs() -> u64 {
    60
}

fn default_tun_name() -> String {
    "tunplane".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Quic {
        server: SocketAddr,
        server_name: String,
        #[serde(default = "default_alpn")]
        alpn: Vec<String>,
        #[serde(default = "default_keepalive_secs")]
        keepalive_secs: u64,
        #[serde(default = "default_idle_timeout_secs")]
        idle_timeout_secs: u64,
    },
    Wireguard {
        private_key: String,
        peer_public_key: String,
        #[serde(default)]
        preshared_key: Option<String>,
        endpoint: SocketAddr,
        #[serde(default)]
        persistent_keepalive: Option<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Idle limit for CONNECT flows; 0 disables it.
    #[serde(default)]
    pub tcp_timeout_secs: u64,
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            username: None,
            password: None,
            tcp_timeout_secs: 0,
            udp_timeout_secs: default_udp_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6: bool,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            ipv4: true,
            ipv6: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub transport: TransportConfig,
    /// Tunnel addresses assigned to this client.
    pub ipv4: Ipv4Addr,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub socks: SocksConfig,
    #[serde(default)]
    pub tun: TunConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < MIN_MTU {
            bail!("mtu {} is below the minimum of {MIN_MTU}", self.mtu);
        }
        if self.ipv6.is_some() && self.mtu < MIN_IPV6_MTU {
            bail!("mtu {} is too small for IPv6 (minimum {MIN_IPV6_MTU})", self.mtu);
        }
        if self.socks.username.is_some() != self.socks.password.is_some() {
            bail!("socks.username and socks.password must be set together");
        }
        if self.dns_timeout_ms == 0 {
            bail!("dns_timeout_ms must be positive");
        }
        if self.tun.name.is_empty() || self.tun.name.len() > 15 {
            bail!("tun.name must be 1-15 characters");
        }
        Ok(())
    }

    pub fn stack_addrs(&self) -> StackAddrs {
        StackAddrs {
            ipv4: self.ipv4,
            ipv6: self.ipv6,
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.socks.username, &self.socks.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn socks_settings(&self) -> SocksSettings {
        SocksSettings {
            listen: self.socks.listen,
            credentials: self.credentials(),
            tcp_idle_timeout: (self.socks.tcp_timeout_secs > 0)
                .then(|| Duration::from_secs(self.socks.tcp_timeout_secs)),
            udp_idle_timeout: Duration::from_secs(self.socks.udp_timeout_secs.max(1)),
        }
    }

    pub fn bring_up_plan(&self) -> BringUp {
        BringUp {
            name: self.tun.name.clone(),
            mtu: self.mtu,
            ipv4: self.tun.ipv4.then_some(self.ipv4),
            ipv6: self.ipv6.filter(|_| self.tun.ipv6),
        }
    }
}
