use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(
    name = "tunplane",
    about = "Tunnel client with SOCKS5 and native TUN ingress",
    version = env!("TUNPLANE_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Run the SOCKS5 front-end over the userspace tunnel stack
    Socks {
        /// Listen address (overrides socks.listen)
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Require this username (with --password)
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Password for --username
        #[arg(long, requires = "username")]
        password: Option<String>,
    },

    /// Create a TUN interface and bridge it to the tunnel
    Nativetun {
        /// Interface name (overrides tun.name)
        #[arg(short, long)]
        name: Option<String>,

        /// Skip IPv4 address configuration
        #[arg(long)]
        no_ipv4: bool,

        /// Skip IPv6 address configuration
        #[arg(long)]
        no_ipv6: bool,
    },
}
