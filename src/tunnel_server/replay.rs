///! Replay cache for the control channel: remembers every ciphertext digest
///! seen in the last [`REPLAY_WINDOW`], rejecting repeats.
///!
///! This is an unbounded map swept only on a timer, so a sustained flood of
///! distinct forged ciphertexts can grow it without limit between sweeps;
///! that's a known soft spot, not an oversight (see DESIGN.md).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// How long a digest is remembered before it's eligible for eviction.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How often the janitor sweeps expired digests out of the cache.
pub const REPLAY_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct ReplayCache {
    seen: Mutex<HashMap<[u8; 32], Instant>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `digest` if it hasn't been seen within the current window.
    /// Returns `true` if this is the first time (caller should proceed),
    /// `false` if it's a replay (caller should reject the message).
    pub async fn check_and_insert(&self, digest: [u8; 32]) -> bool {
        let mut seen = self.seen.lock().await;
        match seen.get(&digest) {
            Some(seen_at) if seen_at.elapsed() < REPLAY_WINDOW => false,
            _ => {
                seen.insert(digest, Instant::now());
                true
            }
        }
    }

    pub async fn sweep_expired(&self) {
        let mut seen = self.seen.lock().await;
        seen.retain(|_, seen_at| seen_at.elapsed() < REPLAY_WINDOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_accepted() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert([1u8; 32]).await);
    }

    #[tokio::test]
    async fn repeat_within_window_is_rejected() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert([2u8; 32]).await);
        assert!(!cache.check_and_insert([2u8; 32]).await);
    }

    #[tokio::test]
    async fn distinct_digests_do_not_collide() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert([3u8; 32]).await);
        assert!(cache.check_and_insert([4u8; 32]).await);
    }
}
