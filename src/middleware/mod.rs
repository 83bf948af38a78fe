//! Request-path middleware: rate limiting, sticky sessions, tracing and
//! access logging. The pipeline composes these in a fixed order; see
//! `proxy::pipeline`.

pub mod logging;
pub mod rate_limit;
pub mod sticky;
pub mod trace;

pub use rate_limit::{IpRateLimiter, RateLimitConfig};
pub use sticky::{StickyContext, StickyLookup, StickyManager};
pub use trace::{RequestContext, TraceContext};
