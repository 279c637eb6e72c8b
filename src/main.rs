use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunplane::cli::{Cli, TopCommand};
use tunplane::config::AppConfig;
use tunplane::context::Context;
use tunplane::netstack::TunnelStack;
use tunplane::resolver::TunnelDnsResolver;
use tunplane::socks::SocksServer;
use tunplane::{logging, transport};

const TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

fn main() {
    let cli = Cli::parse();

    if let Some(path) = cli.log_file.as_deref() {
        if let Err(e) = logging::init_file(path, cli.verbose) {
            eprintln!("failed to open log file {path}: {e}");
            std::process::exit(1);
        }
    } else {
        logging::init_terminal(cli.verbose);
    }

    let command = match cli.command {
        TopCommand::Socks { .. } => "socks",
        TopCommand::Nativetun { .. } => "nativetun",
    };

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(command = ?command, error = ?format!("{e:#}"), "config_load_failed");
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = ?e.to_string(), "runtime_start_failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cli.command, config)) {
        error!(command = ?command, error = ?format!("{e:#}"), "command_failed");
        std::process::exit(1);
    }
}

async fn run(command: TopCommand, mut config: AppConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown_requested");
            }
            shutdown.cancel();
        }
    });

    match command {
        TopCommand::Socks {
            listen,
            username,
            password,
        } => {
            if let Some(listen) = listen {
                config.socks.listen = listen;
            }
            if username.is_some() {
                config.socks.username = username;
                config.socks.password = password;
            }
            cmd_socks(config, shutdown).await
        }
        TopCommand::Nativetun {
            name,
            no_ipv4,
            no_ipv6,
        } => {
            if let Some(name) = name {
                config.tun.name = name;
            }
            config.tun.ipv4 &= !no_ipv4;
            config.tun.ipv6 &= !no_ipv6;
            cmd_nativetun(config, shutdown).await
        }
    }
}

async fn connect_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn transport::PacketTransport>> {
    let ctx = Context::background().with_timeout(TRANSPORT_CONNECT_TIMEOUT);
    transport::connect(&ctx, &config.transport, config.mtu)
        .await
        .context("failed to connect tunnel transport")
}

async fn cmd_socks(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let transport = connect_transport(&config).await?;
    let stack = Arc::new(TunnelStack::new(
        transport,
        config.stack_addrs(),
        usize::from(config.mtu),
    ));
    let resolver = Arc::new(TunnelDnsResolver::new(
        stack.clone(),
        config.dns_servers.clone(),
        config.dns_timeout(),
    ));
    let server = SocksServer::bind(config.socks_settings(), resolver, stack).await?;
    server.serve(shutdown).await
}

#[cfg(target_os = "linux")]
async fn cmd_nativetun(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    use tunplane::device::linux::LinuxPlatform;
    use tunplane::tun_bridge::{bring_up, run_bridge};

    let transport = connect_transport(&config).await?;
    let plan = config.bring_up_plan();
    let device = bring_up(&LinuxPlatform, &plan)
        .with_context(|| format!("failed to bring up interface {}", plan.name))?;
    run_bridge(Arc::new(device), transport, shutdown).await
}

#[cfg(not(target_os = "linux"))]
async fn cmd_nativetun(_config: AppConfig, _shutdown: CancellationToken) -> anyhow::Result<()> {
    anyhow::bail!("nativetun is only supported on Linux")
}
