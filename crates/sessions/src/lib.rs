//! Per-session state for the gateway: the live session registry and the
//! sliding-window rate limiter (§4.6, §3).

pub mod rate_limit;
pub mod registry;

pub use rate_limit::RateLimiter;
pub use registry::{SessionRecord, SessionRegistry};
