//! Wall-clock helper shared by every subsystem that stamps frames and
//! records (`last_heartbeat`, `first_discovered`, frame `timestamp`).
//!
//! A single `now_millis()` free function rather than a trait-injected clock:
//! the spec's testable properties (boundary behaviors around the 10-minute
//! online threshold and 3-day expiry) are exercised with
//! `tokio::time::pause`/`advance` over async timers, not by mocking
//! wall-clock reads, so there's no call site that actually needs a fake
//! `now`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, matching the spec's `now` everywhere
/// ("wall-clock ms of most recent evidence of liveness").
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}
