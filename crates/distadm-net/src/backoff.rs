//! Connection retry back-off: uniform random delay in `[1s, 8s]` after any
//! connect/handshake/session failure (spec §4.5 "Connection retry").
//!
//! Grounded on `original_source/network.h`'s `connect_to` 5-second socket
//! timeouts combined with `corenet.cpp`'s forget-and-rediscover behavior on
//! failure.

use rand::Rng;
use std::time::Duration;

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Socket send/receive timeout applied to every connection (spec §5).
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

pub fn next_backoff() -> Duration {
    let millis = rand::thread_rng().gen_range(MIN_BACKOFF.as_millis()..=MAX_BACKOFF.as_millis());
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        for _ in 0..100 {
            let d = next_backoff();
            assert!(d >= MIN_BACKOFF && d <= MAX_BACKOFF);
        }
    }
}
