//! Tokio UDP transport for KRPC messages (spec §4.1/§5): a bound socket,
//! an egress token-bucket rate limiter, and a per-endpoint connection
//! throttler.

pub mod rate_limiter;
pub mod socket;
pub mod throttle;

pub use rate_limiter::{
    RateLimitError,
    RateLimiter,
};
pub use socket::{
    KrpcSocket,
    SocketError,
};
pub use throttle::ConnectionThrottler;
