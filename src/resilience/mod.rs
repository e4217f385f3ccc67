//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Logical request:
//!     → timeouts.rs (overall deadline, per-attempt budget)
//!     → retries.rs (bounded attempt loop, backoff.rs between attempts)
//!         → each attempt: circuit_breaker.rs gates the chosen target
//!         → outcome reported back to the breaker through its permit
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every attempt is bounded by
//!   `min(per_attempt, remaining deadline)`
//! - Only network errors, timeouts and 5xx are retried
//! - Circuit breaker prevents cascading failures, one per target by default

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerPermit, BreakerRegistry, BreakerState, BreakerStats, CircuitBreaker};
pub use retries::{RetryExecutor, RetryPolicy};
pub use timeouts::Deadline;
