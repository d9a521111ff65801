///! Shared wall-clock helpers. Tunnel timestamps are Unix seconds, not
///! `std::time::Instant`, because they cross the wire (control envelope
///! freshness checks) where only an absolute clock makes sense.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix seconds. Panics only if the system clock is set
/// before 1970, which we treat as an unrecoverable environment fault.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
