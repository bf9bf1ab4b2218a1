//! Gates in front of the executor: duplicate suppression, failure circuit and
//! adaptive pacing.

pub mod circuit_breaker;
pub mod idempotency;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitListener, CircuitState, CircuitStatus, FailureRecord,
};
pub use idempotency::{IdempotencyManager, ReserveOutcome};
pub use rate_limiter::{ExecutionRecord, RateLimiter, RateLimiterStatus};
