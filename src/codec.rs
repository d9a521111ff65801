///! DNS-safe request/response codec.
///!
///! Requests travel as the left-hand labels of a DNS question name, so they're
///! encoded with an alphabet and casing DNS is indifferent to (base32, extended
///! hex alphabet, uppercase) and split into sub-63-byte labels. Responses travel
///! inside a TXT string, which has no charset restriction beyond being a
///! byte string, so they use plain base64url.

use data_encoding::{BASE32HEX_NOPAD, BASE64URL_NOPAD};

use crate::error::{Result, TunnelError};

/// RFC 1035 label length limit.
const MAX_LABEL_LEN: usize = 63;

/// Total DNS name length limit (octets), including the trailing root label.
const MAX_QNAME_LEN: usize = 254;

/// Fixed per-message overhead ahead of the raw payload: 1 header byte +
/// 8 byte session ID + 2 byte fragment header.
const MESSAGE_OVERHEAD: usize = 1 + 8 + 2;

/// Conservative constant response budget: ~150 bytes of decoded payload fit
/// in a single TXT answer string after base64url expansion and DNS framing.
pub const MAX_RESPONSE_SIZE: usize = 150;

/// Encode raw bytes as base32 (extended hex alphabet, no padding), splitting
/// into dot-separated chunks of at most 63 characters so each chunk can be
/// used directly as a DNS label.
pub fn encode_request(data: &[u8]) -> String {
    let encoded = BASE32HEX_NOPAD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / MAX_LABEL_LEN);

    for (i, chunk) in encoded.as_bytes().chunks(MAX_LABEL_LEN).enumerate() {
        if i > 0 {
            out.push('.');
        }
        // SAFETY: base32 output is ASCII.
        out.push_str(std::str::from_utf8(chunk).expect("base32 output is ASCII"));
    }

    out
}

/// Inverse of [`encode_request`]: strip label dots, uppercase, base32-decode.
pub fn decode_request(encoded: &str) -> Result<Vec<u8>> {
    let stripped = encoded.replace('.', "").to_ascii_uppercase();
    BASE32HEX_NOPAD
        .decode(stripped.as_bytes())
        .map_err(|e| TunnelError::Decode(format!("base32 decode failed: {e}")))
}

/// Encode raw bytes as unpadded URL-safe base64, for embedding in a TXT answer.
pub fn encode_response(data: &[u8]) -> String {
    BASE64URL_NOPAD.encode(data)
}

/// Inverse of [`encode_response`].
pub fn decode_response(encoded: &str) -> Result<Vec<u8>> {
    BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .map_err(|e| TunnelError::Decode(format!("base64 decode failed: {e}")))
}

/// Largest raw payload, in bytes, that can be smuggled in a single request
/// under the given tunnel domain, after accounting for base32 expansion,
/// per-label dot insertion, and the fixed message header.
///
/// `floor((63/64) * floor((5/8) * (254 - |domain|))) - overhead`
pub fn max_request_size(domain: &str) -> usize {
    let budget = MAX_QNAME_LEN.saturating_sub(domain.len());
    let base32_raw_budget = (budget * 5) / 8;
    let label_adjusted = (base32_raw_budget * 63) / 64;
    label_adjusted.saturating_sub(MESSAGE_OVERHEAD)
}

/// Conservative constant response payload budget.
pub fn max_response_size() -> usize {
    MAX_RESPONSE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        for payload in [
            &b""[..],
            b"a",
            b"hello, world!",
            &[0xffu8; 200],
            &(0..=255u8).collect::<Vec<u8>>(),
        ] {
            let encoded = encode_request(payload);
            let decoded = decode_request(&encoded).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn response_round_trips() {
        for payload in [&b""[..], b"x", &[0u8; 300]] {
            let encoded = encode_response(payload);
            let decoded = decode_response(&encoded).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn request_labels_never_exceed_limit() {
        let payload = vec![0x42u8; 500];
        let encoded = encode_request(&payload);
        for label in encoded.split('.') {
            assert!(label.len() <= MAX_LABEL_LEN);
        }
    }

    #[test]
    fn max_request_size_is_consistent_with_overhead() {
        let domain = "tunnel.local";
        let size = max_request_size(domain);
        // Feeding exactly `size` raw bytes plus message overhead through the
        // base32/dot expansion must stay within the QNAME budget.
        let payload = vec![0u8; size + MESSAGE_OVERHEAD];
        let encoded = encode_request(&payload);
        assert!(encoded.len() + domain.len() + 1 <= MAX_QNAME_LEN);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_request("not valid base32!!!").is_err());
        assert!(decode_response("not valid base64!!!").is_err());
    }
}
