///! A single server-side tunnel session: owns the UDP socket dialed to the
///! requested destination, reassembles inbound fragments, and chunks
///! outbound datagrams for polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};

use crate::codec::MAX_RESPONSE_SIZE;
use crate::error::{Result, TunnelError};
use crate::fragment::FragmentTable;
use crate::time_util::now_unix;
use crate::wire::{FragHeader, PollResponse, POLL_NO_DATA, POLL_OK};

/// Nonce (24) + Poly1305 tag (16) that every encrypted poll response pays on
/// top of its plaintext.
const AEAD_OVERHEAD: usize = 24 + 16;
/// `status(u8) || fragHeader(u16 be)`.
const POLL_RESPONSE_HEADER: usize = 1 + 2;
/// Largest outbound chunk that still lets the encrypted, framed poll
/// response fit inside a single TXT answer.
const MAX_OUTBOUND_CHUNK: usize = MAX_RESPONSE_SIZE - AEAD_OVERHEAD - POLL_RESPONSE_HEADER;

/// How long a poll blocks waiting for the feeder to enqueue something before
/// answering `POLL_NO_DATA`.
const POLL_WAIT: Duration = Duration::from_millis(100);

struct FragmentCursor {
    frag_id: u16,
    chunks: Vec<Vec<u8>>,
    next_index: usize,
}

pub struct ServerSession {
    id: u64,
    dest_addr: String,
    upstream: UdpSocket,
    inbound: FragmentTable,
    outbound_queue: Mutex<VecDeque<Vec<u8>>>,
    outbound_ready: Notify,
    outbound_cursor: Mutex<Option<FragmentCursor>>,
    frag_counter: AtomicU16,
    last_active: AtomicU64,
}

impl ServerSession {
    pub async fn open(id: u64, dest_addr: String) -> Result<Arc<Self>> {
        let upstream = UdpSocket::bind("0.0.0.0:0").await?;
        upstream
            .connect(&dest_addr)
            .await
            .map_err(|e| TunnelError::DialFail(format!("{dest_addr}: {e}")))?;

        let session = Arc::new(Self {
            id,
            dest_addr,
            upstream,
            inbound: FragmentTable::new(),
            outbound_queue: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            outbound_cursor: Mutex::new(None),
            frag_counter: AtomicU16::new(0),
            last_active: AtomicU64::new(now_unix()),
        });

        let reader = session.clone();
        tokio::spawn(async move { reader.read_upstream_loop().await });

        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dest_addr(&self) -> &str {
        &self.dest_addr
    }

    pub fn touch(&self) {
        self.last_active.store(now_unix(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.last_active.load(Ordering::Relaxed);
        std::time::Duration::from_secs(now_unix().saturating_sub(last))
    }

    fn next_frag_id(&self) -> u16 {
        self.frag_counter.fetch_add(1, Ordering::Relaxed) % (crate::wire::MAX_FRAG_ID + 1)
    }

    async fn read_upstream_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        loop {
            match self.upstream.recv(&mut buf).await {
                Ok(n) => {
                    self.outbound_queue
                        .lock()
                        .await
                        .push_back(buf[..n].to_vec());
                    self.outbound_ready.notify_one();
                }
                Err(e) => {
                    log::warn!(
                        "upstream socket for session {} ({}) closed: {e}",
                        self.id,
                        self.dest_addr
                    );
                    return;
                }
            }
        }
    }

    /// Feed one inbound fragment from the client. Forwards the datagram to
    /// the dialed destination the moment it reassembles.
    pub async fn feed_fragment(&self, header: FragHeader, data: Vec<u8>) -> Result<()> {
        if let Some(datagram) = self.inbound.feed(header, data)? {
            self.upstream.send(&datagram).await?;
        }
        self.touch();
        Ok(())
    }

    /// Block up to [`POLL_WAIT`] for the feeder to enqueue a datagram,
    /// returning it the moment it arrives (or immediately if one is already
    /// queued). Returns `None` once the wait is exhausted empty-handed.
    async fn wait_for_datagram(&self) -> Option<Vec<u8>> {
        // `notified()` must be created before the first queue check so a
        // notification racing with that check isn't lost: Tokio buffers one
        // permit for a `Notified` future created before `notify_one` fires.
        let ready = self.outbound_ready.notified();
        tokio::pin!(ready);

        if let Some(datagram) = self.outbound_queue.lock().await.pop_front() {
            return Some(datagram);
        }

        tokio::select! {
            _ = &mut ready => {}
            _ = tokio::time::sleep(POLL_WAIT) => {}
        }

        self.outbound_queue.lock().await.pop_front()
    }

    /// Produce the next chunk of queued downstream data, or a
    /// [`POLL_NO_DATA`] response if nothing arrived within [`POLL_WAIT`].
    pub async fn next_poll_chunk(&self) -> Result<PollResponse> {
        let mut cursor_guard = self.outbound_cursor.lock().await;

        if cursor_guard.is_none() {
            let Some(datagram) = self.wait_for_datagram().await else {
                return Ok(PollResponse::empty(POLL_NO_DATA));
            };

            let chunks: Vec<Vec<u8>> = if datagram.is_empty() {
                vec![Vec::new()]
            } else {
                datagram
                    .chunks(MAX_OUTBOUND_CHUNK.max(1))
                    .map(|c| c.to_vec())
                    .collect()
            };
            *cursor_guard = Some(FragmentCursor {
                frag_id: self.next_frag_id(),
                chunks,
                next_index: 0,
            });
        }

        let cursor = cursor_guard.as_mut().expect("cursor populated above");
        let is_final = cursor.next_index == cursor.chunks.len() - 1;
        let frag_header = FragHeader::new(cursor.frag_id, cursor.next_index as u8, is_final)?;
        let data = cursor.chunks[cursor.next_index].clone();
        cursor.next_index += 1;

        if cursor.next_index >= cursor.chunks.len() {
            *cursor_guard = None;
        }

        self.touch();
        Ok(PollResponse {
            status: POLL_OK,
            frag_header,
            data,
        })
    }
}
