//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs), one loop per pool:
//!     Periodic timer
//!     → Probe every target of the current snapshot (GET health path)
//!     → TargetPool::record_probe (by key, against the live snapshot)
//!     → Unknown/Healthy ←→ Unhealthy after N consecutive results
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Health state is per-target and orthogonal to the circuit breaker:
//!   health reflects reachability, the breaker reflects error rate
//! - Request outcomes only move counters; probes own the health flag

pub mod active;

pub use active::HealthChecker;
