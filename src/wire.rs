///! Bit-packed wire framing for the tunnel protocol: outer request headers,
///! the fragment header, and the session-open/poll/write message bodies.
///!
///! All multi-byte integers are big-endian. Every `data` field is
///! length-implicit: it extends to the end of whatever buffer it was
///! decrypted or decoded out of.

use crate::error::{Result, TunnelError};

/// Outer header byte: the remainder of the message is an encrypted control
/// payload (`timestamp_be64 || ctrl_header_byte || body`).
pub const REQ_HEADER_CTRL: u8 = 0x00;

/// Outer header byte: the remainder of the message is an unencrypted
/// [`WriteRequest`].
pub const REQ_HEADER_DATA: u8 = 0x01;

/// Control header byte: body is a [`SessionOpenRequest`].
pub const CTRL_SESSION_OPEN: u8 = 0x00;

/// Control header byte: body is a [`PollRequest`].
pub const CTRL_SESSION_POLL: u8 = 0x01;

/// `SessionOpenResponse.status`: session created.
pub const STATUS_OK: u8 = 0;
/// `SessionOpenResponse.status`: server could not dial the requested upstream.
pub const STATUS_DIAL_FAIL: u8 = 1;
/// `SessionOpenResponse.status`: unspecified server-side error.
pub const STATUS_ERROR: u8 = 2;

/// `PollResponse`/`WriteResponse.status`: `data` holds reassembled or
/// in-flight bytes.
pub const POLL_OK: u8 = 0;
/// `PollResponse`/`WriteResponse.status`: no data queued; retry later.
pub const POLL_NO_DATA: u8 = 1;
/// `PollResponse`/`WriteResponse.status`: the session is gone.
pub const POLL_ERROR: u8 = 2;
/// `PollResponse`/`WriteResponse.status`: poll/write against an unknown
/// session ID.
pub const POLL_CLOSED: u8 = 3;

/// Highest valid fragment ID (10-bit space).
pub const MAX_FRAG_ID: u16 = (1 << 10) - 1;
/// Highest valid fragment index (5-bit space).
pub const MAX_FRAG_INDEX: u8 = (1 << 5) - 1;

/// `ID(10) || Index(5) || IsFinal(1)`, packed big-endian into 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    pub id: u16,
    pub index: u8,
    pub is_final: bool,
}

impl FragHeader {
    pub fn new(id: u16, index: u8, is_final: bool) -> Result<Self> {
        if id > MAX_FRAG_ID {
            return Err(TunnelError::FragInvalid(format!(
                "fragment id {id} exceeds {MAX_FRAG_ID}"
            )));
        }
        if index > MAX_FRAG_INDEX {
            return Err(TunnelError::FragInvalid(format!(
                "fragment index {index} exceeds {MAX_FRAG_INDEX}"
            )));
        }
        Ok(Self {
            id,
            index,
            is_final,
        })
    }

    pub fn marshal(&self) -> [u8; 2] {
        let packed: u16 = (self.id << 6) | ((self.index as u16) << 1) | (self.is_final as u16);
        packed.to_be_bytes()
    }

    pub fn unmarshal(bytes: [u8; 2]) -> Result<Self> {
        let packed = u16::from_be_bytes(bytes);
        let id = packed >> 6;
        let index = ((packed >> 1) & MAX_FRAG_INDEX as u16) as u8;
        let is_final = (packed & 1) != 0;
        Self::new(id, index, is_final)
    }
}

fn take_u64(buf: &[u8]) -> Result<(u64, &[u8])> {
    if buf.len() < 8 {
        return Err(TunnelError::Decode("buffer too short for u64".to_string()));
    }
    let (head, rest) = buf.split_at(8);
    Ok((u64::from_be_bytes(head.try_into().unwrap()), rest))
}

fn take_frag_header(buf: &[u8]) -> Result<(FragHeader, &[u8])> {
    if buf.len() < 2 {
        return Err(TunnelError::Decode(
            "buffer too short for fragment header".to_string(),
        ));
    }
    let (head, rest) = buf.split_at(2);
    let header = FragHeader::unmarshal([head[0], head[1]])?;
    Ok((header, rest))
}

/// Plaintext control-channel envelope: `timestamp_be64 || ctrl_header_byte || body`.
pub struct ControlEnvelope {
    pub timestamp: u64,
    pub ctrl_header: u8,
    pub body: Vec<u8>,
}

impl ControlEnvelope {
    pub fn marshal(timestamp: u64, ctrl_header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + body.len());
        out.extend_from_slice(&timestamp.to_be_bytes());
        out.push(ctrl_header);
        out.extend_from_slice(body);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(TunnelError::Decode(
                "control envelope shorter than header".to_string(),
            ));
        }
        let (timestamp, rest) = take_u64(buf)?;
        let ctrl_header = rest[0];
        let body = rest[1..].to_vec();
        Ok(Self {
            timestamp,
            ctrl_header,
            body,
        })
    }
}

/// Request to create a new session; plaintext body is the dial target.
pub struct SessionOpenRequest {
    pub dest_addr: String,
}

impl SessionOpenRequest {
    pub fn marshal(&self) -> Vec<u8> {
        self.dest_addr.as_bytes().to_vec()
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let dest_addr = String::from_utf8(buf.to_vec())
            .map_err(|e| TunnelError::Decode(format!("dest addr not utf-8: {e}")))?;
        Ok(Self { dest_addr })
    }
}

pub struct SessionOpenResponse {
    pub status: u8,
    pub id: u64,
}

impl SessionOpenResponse {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.status);
        out.extend_from_slice(&self.id.to_be_bytes());
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(TunnelError::Decode(
                "session open response too short".to_string(),
            ));
        }
        let status = buf[0];
        let (id, _) = take_u64(&buf[1..])?;
        Ok(Self { status, id })
    }
}

pub struct PollRequest {
    pub id: u64,
}

impl PollRequest {
    pub fn marshal(&self) -> Vec<u8> {
        self.id.to_be_bytes().to_vec()
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let (id, _) = take_u64(buf)?;
        Ok(Self { id })
    }
}

/// Shared layout for `PollResponse` and `WriteResponse`:
/// `status(u8) || fragHeader(u16 be) || data[]`.
pub struct PollResponse {
    pub status: u8,
    pub frag_header: FragHeader,
    pub data: Vec<u8>,
}

impl PollResponse {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.push(self.status);
        out.extend_from_slice(&self.frag_header.marshal());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(TunnelError::Decode("poll response empty".to_string()));
        }
        let status = buf[0];
        let (frag_header, rest) = take_frag_header(&buf[1..])?;
        Ok(Self {
            status,
            frag_header,
            data: rest.to_vec(),
        })
    }

    /// A response with no fragment payload, used for CLOSED/ERROR/NO_DATA signals.
    pub fn empty(status: u8) -> Self {
        Self {
            status,
            frag_header: FragHeader {
                id: 0,
                index: 0,
                is_final: true,
            },
            data: Vec::new(),
        }
    }
}

/// `WriteResponse` shares [`PollResponse`]'s layout.
pub type WriteResponse = PollResponse;

/// `id(u64 be) || fragHeader(u16 be) || data[]`.
pub struct WriteRequest {
    pub id: u64,
    pub frag_header: FragHeader,
    pub data: Vec<u8>,
}

impl WriteRequest {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.data.len());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.frag_header.marshal());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let (id, rest) = take_u64(buf)?;
        let (frag_header, rest) = take_frag_header(rest)?;
        Ok(Self {
            id,
            frag_header,
            data: rest.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frag_header_round_trips_full_range() {
        for id in [0u16, 1, 512, MAX_FRAG_ID] {
            for index in [0u8, 1, 16, MAX_FRAG_INDEX] {
                for is_final in [false, true] {
                    let header = FragHeader::new(id, index, is_final).unwrap();
                    let bytes = header.marshal();
                    let decoded = FragHeader::unmarshal(bytes).unwrap();
                    assert_eq!(decoded, header);
                }
            }
        }
    }

    #[test]
    fn frag_header_rejects_out_of_range() {
        assert!(FragHeader::new(MAX_FRAG_ID + 1, 0, false).is_err());
        assert!(FragHeader::new(0, MAX_FRAG_INDEX + 1, false).is_err());
    }

    #[test]
    fn session_open_request_round_trips() {
        let req = SessionOpenRequest {
            dest_addr: "127.0.0.1:51820".to_string(),
        };
        let marshaled = req.marshal();
        let decoded = SessionOpenRequest::unmarshal(&marshaled).unwrap();
        assert_eq!(decoded.dest_addr, req.dest_addr);
    }

    #[test]
    fn session_open_response_round_trips() {
        let resp = SessionOpenResponse {
            status: STATUS_OK,
            id: 0xdead_beef_1234_5678,
        };
        let decoded = SessionOpenResponse::unmarshal(&resp.marshal()).unwrap();
        assert_eq!(decoded.status, resp.status);
        assert_eq!(decoded.id, resp.id);
    }

    #[test]
    fn write_request_round_trips() {
        let req = WriteRequest {
            id: 42,
            frag_header: FragHeader::new(3, 1, true).unwrap(),
            data: b"hello".to_vec(),
        };
        let decoded = WriteRequest::unmarshal(&req.marshal()).unwrap();
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.frag_header, req.frag_header);
        assert_eq!(decoded.data, req.data);
    }

    #[test]
    fn poll_response_round_trips() {
        let resp = PollResponse {
            status: POLL_OK,
            frag_header: FragHeader::new(7, 2, false).unwrap(),
            data: b"chunk".to_vec(),
        };
        let decoded = PollResponse::unmarshal(&resp.marshal()).unwrap();
        assert_eq!(decoded.status, resp.status);
        assert_eq!(decoded.frag_header, resp.frag_header);
        assert_eq!(decoded.data, resp.data);
    }

    #[test]
    fn control_envelope_round_trips() {
        let marshaled = ControlEnvelope::marshal(1_700_000_000, CTRL_SESSION_OPEN, b"body");
        let decoded = ControlEnvelope::unmarshal(&marshaled).unwrap();
        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.ctrl_header, CTRL_SESSION_OPEN);
        assert_eq!(decoded.body, b"body");
    }
}
