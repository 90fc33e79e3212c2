//! Time utilities for the room simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Simulation ticks per second
pub const TICK_RATE: u32 = 64;
/// 15.625ms
pub const TICK_DURATION: Duration = Duration::from_micros(1_000_000 / TICK_RATE as u64);

/// Delta time for one tick (in seconds)
pub fn tick_delta() -> f64 {
    1.0 / TICK_RATE as f64
}

/// Convert a room-clock timestamp in milliseconds into a tick index.
/// Saturates for timestamps too large to scale.
pub fn millis_to_tick(millis: u64) -> u64 {
    millis.saturating_mul(TICK_RATE as u64) / 1000
}
