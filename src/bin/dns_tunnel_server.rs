//! CLI front-end for the tunnel server: binds UDP:53 (or whatever
//! `--listen-addr` names) and answers tunnel questions for `--domain`.

use std::net::SocketAddr;

use clap::Parser;
use dns_tunnel::tunnel_server::{ServerConfig, ServerEngine};

#[derive(Parser, Debug)]
#[command(name = "dns-tunnel-server", about = "Terminate a DNS tunnel and forward to UDP")]
struct Args {
    /// Tunnel domain this server is authoritative for.
    #[arg(long, default_value = "tunnel.local")]
    domain: String,

    /// Address to receive DNS questions on.
    #[arg(long, default_value = "127.0.0.1:5432")]
    listen_addr: SocketAddr,

    /// Nameserver name handed back for NS questions against `--domain`.
    #[arg(long, default_value = "ns1.tunnel.local")]
    nameserver: String,

    /// Pre-shared key authenticating the control channel.
    #[arg(long, env = "DNS_TUNNEL_PSK")]
    psk: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        domain: args.domain,
        listen_addr: args.listen_addr,
        nameserver: args.nameserver,
        psk: args.psk,
    };

    log::info!(
        "dns-tunnel-server answering for {} on {}",
        config.domain,
        config.listen_addr
    );

    let engine = ServerEngine::bind(config).await?;
    engine.run().await?;
    Ok(())
}
