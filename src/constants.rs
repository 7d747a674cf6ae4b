//! Application-wide constants for cadence-relay.
//!
//! Defaults for the relay core and its collaborators live here so the
//! config layer, CLI and tests agree on a single value.
//!
//! # Categories
//!
//! - **Cadence**: tick rate and buffer sizing
//! - **Framing**: line decoder limits and markers
//! - **Delivery**: WebSocket endpoint defaults and timeouts

use std::time::Duration;

// ============================================================================
// Cadence
// ============================================================================

/// Default delivery rate in ticks per second.
///
/// 125 Hz gives an 8 ms tick. See DESIGN.md for why this wins over the
/// 100 Hz figure that also circulates for the same device.
pub const DEFAULT_TICK_HZ: u32 = 125;

/// Default relay buffer capacity in samples.
///
/// 2000 samples is 16 seconds of backlog at 125 Hz.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2000;

/// Convert a tick rate into the fixed tick interval.
///
/// Integer nanoseconds keep 125 Hz at exactly 8 ms.
///
/// # Panics
///
/// Panics if `hz == 0`.
#[must_use]
pub fn tick_interval(hz: u32) -> Duration {
    assert!(hz > 0, "tick rate must be > 0");
    Duration::from_nanos(1_000_000_000 / u64::from(hz))
}

// ============================================================================
// Framing
// ============================================================================

/// Default prefix marking a device diagnostic line (e.g. `[debug] ...`).
pub const DEFAULT_DIAGNOSTIC_PREFIX: &str = "[";

/// Longest unterminated line the decoder will carry (64 KiB).
///
/// Anything longer is a corrupt stream; the fragment is dropped and the
/// decoder resynchronizes at the next newline.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Read size for device link chunks.
pub const LINK_READ_CHUNK: usize = 4 * 1024;

/// Limit on connecting to a device and writing its handshake.
pub const DEVICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Delivery
// ============================================================================

/// Default WebSocket listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";

/// WebSocket path consumers connect to.
pub const STREAM_PATH: &str = "/ws/stream";

/// WebSocket path for device control (connect, disconnect, status).
pub const CONTROL_PATH: &str = "/ws/control";

/// Backoff after a failed `accept()` on the delivery listener.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long to wait for a consumer to acknowledge our close frame.
pub const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tick_is_8ms() {
        assert_eq!(tick_interval(DEFAULT_TICK_HZ), Duration::from_millis(8));
    }

    #[test]
    fn test_100hz_is_10ms() {
        assert_eq!(tick_interval(100), Duration::from_millis(10));
    }

    #[test]
    #[should_panic(expected = "tick rate must be > 0")]
    fn test_zero_hz_panics() {
        let _ = tick_interval(0);
    }

    #[test]
    fn test_paths_are_absolute_and_distinct() {
        assert!(STREAM_PATH.starts_with('/'));
        assert!(CONTROL_PATH.starts_with('/'));
        assert_ne!(STREAM_PATH, CONTROL_PATH);
    }

    #[test]
    fn test_close_ack_wait_is_independent_of_accept_retry() {
        assert_eq!(CLOSE_ACK_TIMEOUT, Duration::from_secs(1));
        assert!(CLOSE_ACK_TIMEOUT < DEVICE_CONNECT_TIMEOUT);
    }
}
