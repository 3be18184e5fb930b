//! Resilience policies for saga workloads.
//!
//! - [`CircuitBreakerManager`]: per-name failure-rate circuit breakers.
//! - [`RateLimiter`]: per-key token-bucket admission control.
//! - [`BatchProcessor`]: chunked, bounded-concurrency batch runner with
//!   per-item timeouts, optional retries and optional backpressure.
//!
//! All registries are safe to share across tasks behind an `Arc`.

pub mod batch;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use batch::{BatchConfig, BatchProcessor, BatchReport, BatchStats, process_saga_batch};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager,
    CircuitBreakerStats, CircuitState, StateTransition,
};
pub use rate_limiter::{RateLimitConfig, RateLimitInfo, RateLimiter};
