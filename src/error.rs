//! Unified error taxonomy for the tunnel protocol engine.

use thiserror::Error;

/// Errors produced by the tunnel protocol engine (codec, crypto, wire
/// framing, fragmentation, session, and DNS front/back-end layers).
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A DNS exchange failed: timeout, no answer, non-TXT answer, or an
    /// empty TXT string.
    #[error("dns transport error: {0}")]
    Transport(String),

    /// Base32/base64 decode failure, or a buffer shorter than the
    /// message it's supposed to hold.
    #[error("decode error: {0}")]
    Decode(String),

    /// AEAD open failure or a ciphertext shorter than the nonce.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Replayed or too-skewed control message.
    #[error("replay rejected: {0}")]
    Replay(String),

    /// Server could not dial the requested upstream destination.
    #[error("dial failed: {0}")]
    DialFail(String),

    /// Poll/write referenced a session ID the server doesn't know about.
    #[error("session closed")]
    SessionClosed,

    /// Fragment header `ID` or `Index` fell outside the valid range.
    #[error("invalid fragment header: {0}")]
    FragInvalid(String),

    /// Local UDP socket could not be bound; fatal to the caller.
    #[error("listen failed: {0}")]
    FatalListen(#[source] std::io::Error),

    /// Any I/O error not covered by a more specific variant above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
