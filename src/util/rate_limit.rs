//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified frames per second
pub fn create_limiter(frames_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(frames_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Inbound frame limit per connection. Clients send at most one input per
/// tick (64 Hz) plus the occasional join packet.
pub const INBOUND_FRAME_LIMIT: u32 = 128;

/// Per-connection flood guard
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    frame_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self::with_limit(INBOUND_FRAME_LIMIT)
    }

    pub fn with_limit(frames_per_second: u32) -> Self {
        Self {
            frame_limiter: create_limiter(frames_per_second),
        }
    }

    /// Check if an inbound frame is allowed (returns true if allowed)
    pub fn check_frame(&self) -> bool {
        self.frame_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
