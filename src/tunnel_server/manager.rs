///! Dispatches decoded DNS questions to session operations and builds the
///! matching answers (C8). This is the only place that knows how outer
///! request headers, control headers, and the replay cache fit together.

use std::collections::HashMap;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::RwLock;

use crate::codec;
use crate::crypto::{replay_digest, TunnelCipher};
use crate::dns;
use crate::error::{Result, TunnelError};
use crate::time_util::now_unix;
use crate::tunnel_server::replay::ReplayCache;
use crate::tunnel_server::session::ServerSession;
use crate::wire::{
    ControlEnvelope, PollRequest, SessionOpenRequest, SessionOpenResponse, WriteRequest,
    CTRL_SESSION_OPEN, CTRL_SESSION_POLL, POLL_CLOSED, POLL_ERROR, REQ_HEADER_CTRL,
    REQ_HEADER_DATA, STATUS_OK,
};

/// Control envelopes timestamped further from the server's clock than this
/// are rejected outright, on the same footing as a replay. Matches the
/// `AllowedClockSkew` named in the data model.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Literal TXT body meaning "unknown session, replay, or malformed request".
const TXT_REJECT: &str = "no";
/// Literal TXT body meaning "could not dial the requested destination".
const TXT_DIAL_FAIL: &str = "sad";

pub struct SessionManager {
    domain: String,
    cipher: TunnelCipher,
    sessions: RwLock<HashMap<u64, std::sync::Arc<ServerSession>>>,
    replay: ReplayCache,
}

impl SessionManager {
    pub fn new(domain: String, psk: &str) -> Self {
        Self {
            domain,
            cipher: TunnelCipher::from_psk(psk),
            sessions: RwLock::new(HashMap::new()),
            replay: ReplayCache::new(),
        }
    }

    /// Handle one raw DNS query packet, returning the raw DNS response to
    /// send back. Never returns `Err` for a malformed or malicious query --
    /// those produce a [`TXT_REJECT`] answer -- only for failures that leave
    /// nothing sensible to answer with (e.g. the query itself didn't parse).
    pub async fn handle_query(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let query = dns::parse_query(packet)?;
        let (is_ctrl, label_part) = match split_fqdn(&query.name, &self.domain) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("rejecting query outside tunnel domain: {e}");
                return dns::build_txt_response(query.id, &query.name, TXT_REJECT);
            }
        };

        let body = match codec::decode_request(label_part) {
            Ok(b) if !b.is_empty() => b,
            _ => return dns::build_txt_response(query.id, &query.name, TXT_REJECT),
        };

        let outer_header = body[0];
        let payload = &body[1..];

        let result = match (outer_header, is_ctrl) {
            (h, true) if h == REQ_HEADER_CTRL => self.handle_ctrl(payload).await,
            (h, false) if h == REQ_HEADER_DATA => self.handle_data(payload).await,
            _ => Err(TunnelError::Decode(
                "outer header / fqdn prefix mismatch".to_string(),
            )),
        };

        match result {
            Ok(Some(encoded)) => dns::build_txt_response(query.id, &query.name, &encoded),
            Ok(None) => dns::build_txt_response(query.id, &query.name, TXT_REJECT),
            Err(TunnelError::DialFail(reason)) => {
                log::info!("dial failed: {reason}");
                dns::build_txt_response(query.id, &query.name, TXT_DIAL_FAIL)
            }
            Err(e) => {
                log::debug!("rejecting malformed or unauthenticated request: {e}");
                dns::build_txt_response(query.id, &query.name, TXT_REJECT)
            }
        }
    }

    async fn handle_ctrl(&self, encrypted: &[u8]) -> Result<Option<String>> {
        let digest = replay_digest(encrypted);
        if !self.replay.check_and_insert(digest).await {
            return Err(TunnelError::Replay("ciphertext seen before".to_string()));
        }

        let envelope_bytes = self.cipher.decrypt(encrypted)?;
        let envelope = ControlEnvelope::unmarshal(&envelope_bytes)?;

        let skew = now_unix().abs_diff(envelope.timestamp);
        if Duration::from_secs(skew) > MAX_CLOCK_SKEW {
            return Err(TunnelError::Replay(format!(
                "control envelope clock skew {skew}s exceeds {MAX_CLOCK_SKEW:?}"
            )));
        }

        match envelope.ctrl_header {
            CTRL_SESSION_OPEN => self.handle_session_open(&envelope.body).await,
            CTRL_SESSION_POLL => self.handle_poll(&envelope.body).await,
            other => Err(TunnelError::Decode(format!(
                "unknown control header {other}"
            ))),
        }
    }

    async fn handle_session_open(&self, body: &[u8]) -> Result<Option<String>> {
        let request = SessionOpenRequest::unmarshal(body)?;
        let id = self.allocate_session_id().await;

        let session = ServerSession::open(id, request.dest_addr).await?;
        self.sessions.write().await.insert(id, session);

        let response = SessionOpenResponse {
            status: STATUS_OK,
            id,
        };
        let encrypted = self.cipher.encrypt(&response.marshal())?;
        Ok(Some(codec::encode_response(&encrypted)))
    }

    async fn handle_poll(&self, body: &[u8]) -> Result<Option<String>> {
        let request = PollRequest::unmarshal(body)?;
        let session = match self.sessions.read().await.get(&request.id).cloned() {
            Some(s) => s,
            None => {
                let closed = crate::wire::PollResponse::empty(POLL_CLOSED);
                return self.encode_ctrl_response(&closed);
            }
        };

        let response = match session.next_poll_chunk().await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("poll chunk failed for session {}: {e}", request.id);
                crate::wire::PollResponse::empty(POLL_ERROR)
            }
        };
        self.encode_ctrl_response(&response)
    }

    async fn handle_data(&self, body: &[u8]) -> Result<Option<String>> {
        let request = WriteRequest::unmarshal(body)?;
        let session = match self.sessions.read().await.get(&request.id).cloned() {
            Some(s) => s,
            None => {
                let response = crate::wire::WriteResponse::empty(POLL_CLOSED);
                return Ok(Some(codec::encode_response(&response.marshal())));
            }
        };

        session.feed_fragment(request.frag_header, request.data).await?;

        let response = crate::wire::WriteResponse {
            status: crate::wire::POLL_OK,
            frag_header: request.frag_header,
            data: Vec::new(),
        };
        Ok(Some(codec::encode_response(&response.marshal())))
    }

    /// Encrypt and base64url-encode a control-channel response body, as
    /// every poll answer (success or in-band `CLOSED`/`ERROR`) must be.
    fn encode_ctrl_response(&self, response: &crate::wire::PollResponse) -> Result<Option<String>> {
        let encrypted = self.cipher.encrypt(&response.marshal())?;
        Ok(Some(codec::encode_response(&encrypted)))
    }

    async fn allocate_session_id(&self) -> u64 {
        let sessions = self.sessions.read().await;
        loop {
            let candidate = rand::thread_rng().next_u64();
            if candidate != 0 && !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Drop sessions idle for longer than `idle_after`.
    pub async fn sweep_idle(&self, idle_after: Duration) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|id, session| {
            let keep = session.idle_for() < idle_after;
            if !keep {
                log::debug!("reaping idle server session {id} ({})", session.dest_addr());
            }
            keep
        });
    }

    pub async fn sweep_replay_cache(&self) {
        self.replay.sweep_expired().await;
    }
}

/// Split `name` (a fully-qualified question name) into its control/data
/// prefix flag and the base32 label portion, stripping the trailing tunnel
/// `domain`.
fn split_fqdn<'a>(name: &'a str, domain: &str) -> Result<(bool, &'a str)> {
    let trimmed = name.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    let suffix = format!(".{domain}");

    let without_domain = if trimmed.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
        &trimmed[..trimmed.len() - suffix.len()]
    } else {
        return Err(TunnelError::Decode(format!(
            "query name {trimmed} is not under tunnel domain {domain}"
        )));
    };

    let (prefix, label_part) = without_domain
        .split_once('.')
        .ok_or_else(|| TunnelError::Decode("missing control/data prefix label".to_string()))?;

    match prefix {
        "c" => Ok((true, label_part)),
        "d" => Ok((false, label_part)),
        other => Err(TunnelError::Decode(format!(
            "unrecognized fqdn prefix {other}"
        ))),
    }
}
