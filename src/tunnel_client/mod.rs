///! Client-side tunnel engine (C5/C6): a local UDP listener, a NAT table
///! mapping peers to sessions, and the poll loops that shuttle downstream
///! data back to each peer.

mod nat;
mod session;
mod transport;

pub use nat::NatTable;
pub use session::{ClientSession, POLL_IDLE_INTERVAL};
pub use transport::ClientTransport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::crypto::TunnelCipher;
use crate::error::{Result, TunnelError};

/// 30s sweep interval, 5 minute idle threshold; matches the server's own
/// session janitor so neither side outlives the other by much.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct ClientConfig {
    pub domain: String,
    pub listen_addr: SocketAddr,
    pub dial_addr: String,
    pub resolver: SocketAddr,
    pub psk: String,
    pub threads: usize,
}

/// Owns the local UDP socket real applications (e.g. a WireGuard client)
/// send their encrypted datagrams to, and drives every tunnel session
/// multiplexed behind it.
pub struct ClientEngine {
    config: Arc<ClientConfig>,
    local_socket: Arc<UdpSocket>,
    nat: Arc<NatTable>,
    cipher: Arc<TunnelCipher>,
    write_permits: Arc<Semaphore>,
}

impl ClientEngine {
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        let local_socket = Arc::new(
            UdpSocket::bind(config.listen_addr)
                .await
                .map_err(TunnelError::FatalListen)?,
        );
        let cipher = Arc::new(TunnelCipher::from_psk(&config.psk));
        let threads = config.threads.max(1);
        Ok(Self {
            config: Arc::new(config),
            local_socket,
            nat: Arc::new(NatTable::new()),
            cipher,
            write_permits: Arc::new(Semaphore::new(threads)),
        })
    }

    /// Run forever: the janitor task alongside the local-socket receive loop.
    pub async fn run(self) -> Result<()> {
        let nat = self.nat.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(JANITOR_INTERVAL).await;
                nat.sweep_idle(SESSION_IDLE_TIMEOUT).await;
            }
        });

        let mut buf = vec![0u8; 65535];
        loop {
            let (n, peer) = self.local_socket.recv_from(&mut buf).await?;
            let datagram = buf[..n].to_vec();
            self.dispatch(peer, datagram);
        }
    }

    fn dispatch(&self, peer: SocketAddr, datagram: Vec<u8>) {
        let config = self.config.clone();
        let nat = self.nat.clone();
        let cipher = self.cipher.clone();
        let local_socket = self.local_socket.clone();
        let permits = self.write_permits.clone();

        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            let opened = nat
                .get_or_open(peer, Self::open_session(config.clone(), cipher))
                .await;

            let (session, is_new) = match opened {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("failed to open tunnel session for {peer}: {e}");
                    drop(permit);
                    return;
                }
            };

            if is_new {
                let session_for_poll = session.clone();
                let local_socket = local_socket.clone();
                let nat_for_poll = nat.clone();
                tokio::spawn(async move {
                    run_poll_loop(session_for_poll, local_socket, peer, nat_for_poll).await;
                });
            }

            if let Err(e) = session.write(&datagram).await {
                log::warn!("write to session {} failed: {e}", session.id());
            }
            drop(permit);
        });
    }

    async fn open_session(
        config: Arc<ClientConfig>,
        cipher: Arc<TunnelCipher>,
    ) -> Result<Arc<ClientSession>> {
        let transport =
            Arc::new(ClientTransport::bind(config.resolver, config.domain.clone()).await?);
        ClientSession::open(transport, cipher, config.dial_addr.clone()).await
    }
}

/// Repeatedly polls `session` for downstream data and relays it back to
/// `peer` on `local_socket`. Exits once the session reports itself closed,
/// taking the NAT entry down with it.
async fn run_poll_loop(
    session: Arc<ClientSession>,
    local_socket: Arc<UdpSocket>,
    peer: SocketAddr,
    nat: Arc<NatTable>,
) {
    loop {
        match session.poll().await {
            Ok(Some(datagram)) => {
                if let Err(e) = local_socket.send_to(&datagram, peer).await {
                    log::warn!("failed to deliver tunneled datagram to {peer}: {e}");
                }
                // Data may still be queued server-side; ask again immediately.
            }
            Ok(None) => {
                tokio::time::sleep(POLL_IDLE_INTERVAL).await;
            }
            Err(crate::error::TunnelError::SessionClosed) => {
                log::debug!("session {} closed, tearing down poll loop", session.id());
                nat.remove(&peer).await;
                return;
            }
            Err(e) => {
                log::warn!("poll for session {} failed: {e}", session.id());
                tokio::time::sleep(POLL_IDLE_INTERVAL).await;
            }
        }
    }
}
