//! CLI front-end for the tunnel client: binds a local UDP socket and
//! smuggles whatever arrives on it out through DNS questions against
//! `--resolver`.

use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use dns_tunnel::tunnel_client::{ClientConfig, ClientEngine};

#[derive(Parser, Debug)]
#[command(name = "dns-tunnel-client", about = "Smuggle UDP traffic out over DNS")]
struct Args {
    /// Tunnel domain the server is authoritative for.
    #[arg(long, default_value = "tunnel.local")]
    domain: String,

    /// Local address to accept UDP datagrams on.
    #[arg(long, default_value = "127.0.0.1:4321")]
    listen_addr: SocketAddr,

    /// Address the server should forward decoded datagrams to.
    #[arg(long, default_value = "127.0.0.1:51820")]
    dial_addr: String,

    /// DNS resolver to send tunnel questions to.
    #[arg(long, default_value = "8.8.8.8")]
    resolver: IpAddr,

    /// Pre-shared key authenticating the control channel.
    #[arg(long, env = "DNS_TUNNEL_PSK")]
    psk: String,

    /// Concurrent write workers per session.
    #[arg(long, default_value_t = 10)]
    threads: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ClientConfig {
        domain: args.domain,
        listen_addr: args.listen_addr,
        dial_addr: args.dial_addr,
        resolver: SocketAddr::new(args.resolver, 53),
        psk: args.psk,
        threads: args.threads,
    };

    log::info!(
        "dns-tunnel-client listening on {} via resolver {}",
        config.listen_addr,
        config.resolver
    );

    let engine = ClientEngine::bind(config).await?;
    engine.run().await?;
    Ok(())
}
