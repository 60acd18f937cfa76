//! Session and buffer limits.

use serde::{Deserialize, Serialize};

/// Values are explicit about their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Out-of-order arrivals buffered per session before the gap is fatal.
    pub max_buffered_events: usize,
    /// How long a receive gap may stay open before it is fatal.
    pub gap_timeout_ms: u64,
    /// Sent events awaiting peer acknowledgement per session.
    pub max_undelivered_events: usize,
    /// Idle time after which a session is evicted from memory.
    pub session_inactivity_timeout_ms: u64,
    /// Inbound records accepted per `process_events` call.
    pub max_batch_events: usize,
    /// Largest Data payload accepted from the application.
    pub max_payload_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_buffered_events: 1_000,
            gap_timeout_ms: 5 * 60 * 1000,
            max_undelivered_events: 10_000,
            session_inactivity_timeout_ms: 24 * 60 * 60 * 1000,
            max_batch_events: 10_000,
            max_payload_bytes: 10 * 1024 * 1024,
        }
    }
}
