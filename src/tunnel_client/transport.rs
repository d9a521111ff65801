///! DNS round-trip glue for the client: turns an already-framed request body
///! into a `TXT` question against the configured resolver, and turns the
///! answer back into decoded bytes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::codec;
use crate::dns;
use crate::error::{Result, TunnelError};

const DNS_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);
const DNS_EXCHANGE_RETRIES: u32 = 1;

/// Literal TXT bodies the server sends back instead of an encoded response.
const TXT_SESSION_GONE: &str = "no";
const TXT_DIAL_FAILED: &str = "sad";

pub struct ClientTransport {
    resolver: SocketAddr,
    domain: String,
    socket: UdpSocket,
    // A session's write and poll loops both drive this same socket
    // concurrently; serialize send/recv pairs so one task never steals the
    // answer meant for another.
    inflight: Mutex<()>,
}

impl ClientTransport {
    pub async fn bind(resolver: SocketAddr, domain: String) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            resolver,
            domain,
            socket,
            inflight: Mutex::new(()),
        })
    }

    /// Largest raw request body (header byte plus whatever framing the caller
    /// adds) that still fits in one question name under this domain. Only
    /// used for data-channel requests, which carry the bulk payload.
    pub fn max_chunk_size(&self) -> usize {
        codec::max_request_size(&self.domain)
    }

    /// Smuggle `body` out as a question, wait for the paired answer, and
    /// return its decoded payload. `is_ctrl` selects the cosmetic `c.`/`d.`
    /// FQDN prefix the server's dispatcher splits on; callers are
    /// responsible for encrypting control bodies themselves before calling
    /// this.
    pub async fn exchange(&self, body: &[u8], is_ctrl: bool) -> Result<Vec<u8>> {
        let label = codec::encode_request(body);
        let prefix = if is_ctrl { "c" } else { "d" };
        let fqdn = format!("{prefix}.{label}.{domain}.", domain = self.domain);

        let _guard = self.inflight.lock().await;
        let mut last_err = None;
        for attempt in 0..DNS_EXCHANGE_RETRIES {
            match self.exchange_once(&fqdn).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    log::debug!("dns exchange attempt {attempt} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TunnelError::Transport("dns exchange exhausted retries".to_string())
        }))
    }

    async fn exchange_once(&self, fqdn: &str) -> Result<Vec<u8>> {
        let (query_bytes, id) = dns::build_txt_query(fqdn)?;
        self.socket.send_to(&query_bytes, self.resolver).await?;

        let mut buf = [0u8; 2048];
        let deadline = tokio::time::Instant::now() + DNS_EXCHANGE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TunnelError::Transport("dns exchange timed out".to_string()));
            }
            let (n, _from) = timeout(remaining, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| TunnelError::Transport("dns exchange timed out".to_string()))??;

            let (answer_id, txt) = match dns::first_txt_answer_with_id(&buf[..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("dropping malformed dns answer: {e}");
                    continue;
                }
            };
            if answer_id != id {
                log::debug!("dropping dns answer for stale transaction {answer_id}");
                continue;
            }

            return match txt.as_str() {
                TXT_SESSION_GONE => Err(TunnelError::SessionClosed),
                TXT_DIAL_FAILED => Err(TunnelError::DialFail(
                    "server could not dial the requested destination".to_string(),
                )),
                other => codec::decode_response(other),
            };
        }
    }
}
