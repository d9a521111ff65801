///! Control-channel AEAD: XChaCha20-Poly1305 keyed by SHA-256(PSK).
///!
///! Every control message gets a fresh random 24-byte nonce prepended to the
///! ciphertext; there is no session-level nonce counter; the PSK is never
///! used directly as a key; it's first folded through SHA-256 to satisfy the
///! cipher's 32-byte key requirement.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Result, TunnelError};

/// A symmetric key derived once from the pre-shared key and reused for every
/// control message exchanged over a tunnel.
pub struct TunnelCipher {
    cipher: XChaCha20Poly1305,
}

impl TunnelCipher {
    /// Derive the AEAD key from a pre-shared key string via SHA-256.
    pub fn from_psk(psk: &str) -> Self {
        let key = Sha256::digest(psk.as_bytes());
        let cipher = XChaCha20Poly1305::new(&key);
        Self { cipher }
    }

    /// Seal `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| TunnelError::Crypto(format!("seal failed: {e}")))?;

        let mut out = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a blob previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < 24 {
            return Err(TunnelError::Crypto(
                "ciphertext shorter than nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(24);
        let nonce = XNonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| TunnelError::Crypto("AEAD authentication failed".to_string()))
    }
}

/// Compute the replay-cache key for a ciphertext: `SHA-256(nonce || ciphertext)`.
///
/// `blob` is the full `nonce || ciphertext` as produced by [`TunnelCipher::encrypt`].
pub fn replay_digest(blob: &[u8]) -> [u8; 32] {
    Sha256::digest(blob).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_matching_key() {
        let cipher = TunnelCipher::from_psk("hunter2");
        let msg = b"a session open request body";
        let blob = cipher.encrypt(msg).unwrap();
        let opened = cipher.decrypt(&blob).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn fails_with_wrong_key() {
        let a = TunnelCipher::from_psk("hunter2");
        let b = TunnelCipher::from_psk("different");
        let blob = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&blob).is_err());
    }

    #[test]
    fn rejects_short_blobs() {
        let cipher = TunnelCipher::from_psk("hunter2");
        assert!(cipher.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn nonces_are_not_reused() {
        let cipher = TunnelCipher::from_psk("hunter2");
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn replay_digest_is_deterministic() {
        let blob = vec![1u8, 2, 3, 4];
        assert_eq!(replay_digest(&blob), replay_digest(&blob));
    }
}
