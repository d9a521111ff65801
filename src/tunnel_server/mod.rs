///! Server-side tunnel engine (C7/C8): a UDP:53 listener dispatching to the
///! session manager, plus the janitors that keep its tables bounded.

mod manager;
mod replay;
mod session;

pub use manager::SessionManager;
pub use session::ServerSession;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;

use crate::dns;
use crate::error::{Result, TunnelError};
use crate::tunnel_server::replay::REPLAY_JANITOR_INTERVAL;

const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct ServerConfig {
    pub domain: String,
    pub listen_addr: SocketAddr,
    pub nameserver: String,
    pub psk: String,
}

/// Owns the UDP:53 socket and the session manager behind it.
pub struct ServerEngine {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    manager: Arc<SessionManager>,
}

impl ServerEngine {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(config.listen_addr)
                .await
                .map_err(TunnelError::FatalListen)?,
        );
        let manager = Arc::new(SessionManager::new(config.domain.clone(), &config.psk));
        Ok(Self {
            config,
            socket,
            manager,
        })
    }

    pub async fn run(self) -> Result<()> {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(JANITOR_INTERVAL).await;
                manager.sweep_idle(SESSION_IDLE_TIMEOUT).await;
            }
        });

        let manager = self.manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPLAY_JANITOR_INTERVAL).await;
                manager.sweep_replay_cache().await;
            }
        });

        let mut buf = vec![0u8; 2048];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let packet = buf[..n].to_vec();
            self.dispatch(packet, peer);
        }
    }

    fn dispatch(&self, packet: Vec<u8>, peer: SocketAddr) {
        let manager = self.manager.clone();
        let nameserver = self.config.nameserver.clone();
        let send_socket = self.socket.clone();

        tokio::spawn(async move {
            let response = match dns::parse_query(&packet) {
                Ok(query) if query.qtype == RecordType::NS => {
                    dns::build_ns_response(query.id, &query.name, &nameserver)
                }
                Ok(_) => manager.handle_query(&packet).await,
                Err(e) => {
                    log::debug!("dropping unparseable dns packet from {peer}: {e}");
                    return;
                }
            };

            match response {
                Ok(bytes) => {
                    if let Err(e) = send_socket.send_to(&bytes, peer).await {
                        log::warn!("failed to send dns response to {peer}: {e}");
                    }
                }
                Err(e) => log::warn!("failed to build dns response for {peer}: {e}"),
            }
        });
    }
}
