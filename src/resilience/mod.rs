//! Outbound resilience: circuit breaking, retries and the transport that
//! composes both around the upstream HTTP client.

pub mod circuit_breaker;
pub mod retry;
pub mod transport;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use retry::{ExponentialRetry, RetryConfig};
pub use transport::ResilientTransport;
