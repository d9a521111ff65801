//! End-to-end exercise of a session open, a data write, and a poll, talking
//! through the real wire encoding/encryption/fragmentation path over actual
//! loopback sockets -- no mocked transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use dns_tunnel::crypto::TunnelCipher;
use dns_tunnel::time_util::now_unix;
use dns_tunnel::tunnel_client::{ClientSession, ClientTransport};
use dns_tunnel::tunnel_server::SessionManager;
use dns_tunnel::wire::{
    ControlEnvelope, PollRequest, PollResponse, CTRL_SESSION_POLL, POLL_CLOSED, REQ_HEADER_CTRL,
};

const DOMAIN: &str = "tunnel.local";
const PSK: &str = "integration-test-psk";

/// Spin up a tiny "DNS server" that's really just `SessionManager` behind a
/// raw UDP socket, and return the address a client can point `--resolver`
/// at.
async fn spawn_tunnel_server(domain: &str, psk: &str) -> SocketAddr {
    let manager = Arc::new(SessionManager::new(domain.to_string(), psk));
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let packet = buf[..n].to_vec();
            let manager = manager.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Ok(response) = manager.handle_query(&packet).await {
                    let _ = socket.send_to(&response, peer).await;
                }
            });
        }
    });

    addr
}

/// A UDP echo target standing in for whatever the tunnel is really
/// fronting (a WireGuard endpoint, in the motivating use case).
async fn spawn_echo_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn write_then_poll_round_trips_through_upstream_echo() {
    let upstream_addr = spawn_echo_upstream().await;
    let resolver_addr = spawn_tunnel_server(DOMAIN, PSK).await;

    let transport = Arc::new(
        ClientTransport::bind(resolver_addr, DOMAIN.to_string())
            .await
            .unwrap(),
    );
    let cipher = Arc::new(TunnelCipher::from_psk(PSK));
    let session = ClientSession::open(transport, cipher, upstream_addr.to_string())
        .await
        .unwrap();

    session.write(b"hello through the tunnel").await.unwrap();

    let mut received = None;
    for _ in 0..100 {
        if let Some(data) = session.poll().await.unwrap() {
            received = Some(data);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(received, Some(b"hello through the tunnel".to_vec()));
}

#[tokio::test]
async fn large_datagram_survives_fragmentation() {
    let upstream_addr = spawn_echo_upstream().await;
    let resolver_addr = spawn_tunnel_server(DOMAIN, PSK).await;

    let transport = Arc::new(
        ClientTransport::bind(resolver_addr, DOMAIN.to_string())
            .await
            .unwrap(),
    );
    let cipher = Arc::new(TunnelCipher::from_psk(PSK));
    let session = ClientSession::open(transport, cipher, upstream_addr.to_string())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..800u32).map(|i| (i % 256) as u8).collect();
    session.write(&payload).await.unwrap();

    let mut received = None;
    for _ in 0..200 {
        if let Some(data) = session.poll().await.unwrap() {
            received = Some(data);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(received, Some(payload));
}

#[tokio::test]
async fn session_open_with_wrong_psk_is_rejected() {
    let upstream_addr = spawn_echo_upstream().await;
    let resolver_addr = spawn_tunnel_server(DOMAIN, PSK).await;

    let transport = Arc::new(
        ClientTransport::bind(resolver_addr, DOMAIN.to_string())
            .await
            .unwrap(),
    );
    let wrong_cipher = Arc::new(TunnelCipher::from_psk("not-the-right-key"));
    let result = ClientSession::open(transport, wrong_cipher, upstream_addr.to_string()).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn dial_failure_is_reported_as_sad() {
    // Not a parseable `host:port` at all, so resolution fails synchronously
    // with no network round-trip -- deterministic under test isolation.
    let resolver_addr = spawn_tunnel_server(DOMAIN, PSK).await;

    let transport = Arc::new(
        ClientTransport::bind(resolver_addr, DOMAIN.to_string())
            .await
            .unwrap(),
    );
    let cipher = Arc::new(TunnelCipher::from_psk(PSK));
    let result = ClientSession::open(transport, cipher, "not a valid address".to_string()).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn poll_against_unknown_session_gets_in_band_closed_status() {
    let resolver_addr = spawn_tunnel_server(DOMAIN, PSK).await;
    let transport = ClientTransport::bind(resolver_addr, DOMAIN.to_string())
        .await
        .unwrap();
    let cipher = TunnelCipher::from_psk(PSK);

    let body = PollRequest { id: 0xbad_5e55_10e_1d }.marshal();
    let envelope = ControlEnvelope::marshal(now_unix(), CTRL_SESSION_POLL, &body);
    let encrypted = cipher.encrypt(&envelope).unwrap();

    let mut request = vec![REQ_HEADER_CTRL];
    request.extend(encrypted);

    let response_bytes = transport.exchange(&request, true).await.unwrap();
    let decrypted = cipher.decrypt(&response_bytes).unwrap();
    let response = PollResponse::unmarshal(&decrypted).unwrap();

    assert_eq!(response.status, POLL_CLOSED);
}
