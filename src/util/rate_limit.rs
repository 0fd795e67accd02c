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

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Per-connection limiter for inbound WebSocket messages
#[derive(Clone)]
pub struct InputRateLimiter {
    limiter: Arc<Limiter>,
}

impl InputRateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        Self {
            limiter: create_limiter(messages_per_second),
        }
    }

    /// Check if an inbound message is allowed (returns true if allowed)
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
