///! A single client-side tunnel session: one remote session ID, bound to one
///! local UDP peer address, carrying datagrams in both directions.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::crypto::TunnelCipher;
use crate::error::{Result, TunnelError};
use crate::fragment::FragmentTable;
use crate::time_util::now_unix;
use crate::tunnel_client::transport::ClientTransport;
use crate::wire::{
    ControlEnvelope, FragHeader, PollRequest, PollResponse, SessionOpenRequest,
    SessionOpenResponse, WriteRequest, WriteResponse, CTRL_SESSION_OPEN, CTRL_SESSION_POLL,
    MAX_FRAG_INDEX, POLL_CLOSED, POLL_NO_DATA, POLL_OK, REQ_HEADER_CTRL, REQ_HEADER_DATA,
    STATUS_DIAL_FAIL, STATUS_OK,
};

/// How often a poll loop re-asks the server when the last answer carried no
/// data. Chosen to keep idle sessions cheap without starving interactive
/// traffic.
pub const POLL_IDLE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

pub struct ClientSession {
    id: u64,
    transport: Arc<ClientTransport>,
    cipher: Arc<TunnelCipher>,
    frag_counter: AtomicU16,
    frag_table: FragmentTable,
    last_active: AtomicU64,
}

impl ClientSession {
    /// Ask the server to open a session dialing `dest_addr`, returning the
    /// live session on success.
    pub async fn open(
        transport: Arc<ClientTransport>,
        cipher: Arc<TunnelCipher>,
        dest_addr: String,
    ) -> Result<Arc<Self>> {
        let body = SessionOpenRequest { dest_addr }.marshal();
        let envelope = ControlEnvelope::marshal(now_unix(), CTRL_SESSION_OPEN, &body);
        let encrypted = cipher.encrypt(&envelope)?;

        let mut request = vec![REQ_HEADER_CTRL];
        request.extend(encrypted);

        let response_bytes = transport.exchange(&request, true).await?;
        let decrypted = cipher.decrypt(&response_bytes)?;
        let response = SessionOpenResponse::unmarshal(&decrypted)?;

        match response.status {
            STATUS_OK => Ok(Arc::new(Self {
                id: response.id,
                transport,
                cipher,
                frag_counter: AtomicU16::new(0),
                frag_table: FragmentTable::new(),
                last_active: AtomicU64::new(now_unix()),
            })),
            STATUS_DIAL_FAIL => Err(TunnelError::DialFail(
                "server refused to dial the requested destination".to_string(),
            )),
            other => Err(TunnelError::Transport(format!(
                "session open failed with status {other}"
            ))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn touch(&self) {
        self.last_active.store(now_unix(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.last_active.load(Ordering::Relaxed);
        let now = now_unix();
        std::time::Duration::from_secs(now.saturating_sub(last))
    }

    fn next_frag_id(&self) -> u16 {
        self.frag_counter.fetch_add(1, Ordering::Relaxed) % (crate::wire::MAX_FRAG_ID + 1)
    }

    /// Push a full datagram upstream, fragmenting it across the unencrypted
    /// data fast path.
    pub async fn write(&self, datagram: &[u8]) -> Result<()> {
        let chunk_size = self.transport.max_chunk_size().max(1);
        let chunks: Vec<&[u8]> = if datagram.is_empty() {
            vec![&[][..]]
        } else {
            datagram.chunks(chunk_size).collect()
        };
        if chunks.len() > MAX_FRAG_INDEX as usize + 1 {
            return Err(TunnelError::FragInvalid(format!(
                "datagram needs {} fragments, limit is {}",
                chunks.len(),
                MAX_FRAG_INDEX as usize + 1
            )));
        }

        let frag_id = self.next_frag_id();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let frag_header = FragHeader::new(frag_id, i as u8, i == last)?;
            let write_request = WriteRequest {
                id: self.id,
                frag_header,
                data: chunk.to_vec(),
            };

            let mut request = vec![REQ_HEADER_DATA];
            request.extend(write_request.marshal());

            let response_bytes = self.transport.exchange(&request, false).await?;
            let response = WriteResponse::unmarshal(&response_bytes)?;
            if response.status == POLL_CLOSED {
                return Err(TunnelError::SessionClosed);
            }
        }

        self.touch();
        Ok(())
    }

    /// Ask the server for one batch of downstream data. Returns a fully
    /// reassembled datagram once its final fragment arrives, `None` if the
    /// server had nothing queued.
    pub async fn poll(&self) -> Result<Option<Vec<u8>>> {
        let body = PollRequest { id: self.id }.marshal();
        let envelope = ControlEnvelope::marshal(now_unix(), CTRL_SESSION_POLL, &body);
        let encrypted = self.cipher.encrypt(&envelope)?;

        let mut request = vec![REQ_HEADER_CTRL];
        request.extend(encrypted);

        let response_bytes = self.transport.exchange(&request, true).await?;
        let decrypted = self.cipher.decrypt(&response_bytes)?;
        let response = PollResponse::unmarshal(&decrypted)?;

        match response.status {
            POLL_NO_DATA => Ok(None),
            POLL_OK => {
                self.touch();
                self.frag_table.feed(response.frag_header, response.data)
            }
            POLL_CLOSED => Err(TunnelError::SessionClosed),
            other => Err(TunnelError::Transport(format!(
                "poll failed with status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::POLL_IDLE_INTERVAL;

    #[test]
    fn poll_idle_interval_is_sub_second() {
        assert!(POLL_IDLE_INTERVAL.as_millis() > 0);
        assert!(POLL_IDLE_INTERVAL.as_secs() < 1);
    }
}
