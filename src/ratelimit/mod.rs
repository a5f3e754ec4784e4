//! Rate limiting logic and state management.

mod limiter;
mod window;

pub use limiter::{next_midnight, LimiterStatus, RateLimitSettings, RateLimiter};
pub use window::SlidingWindow;
