//! Timeout enforcement.
//!
//! # Responsibilities
//! - Track the overall deadline of one logical request
//! - Derive each attempt's budget as `min(per_attempt, remaining)`
//!
//! # Design Decisions
//! - Uses Tokio's clock so paused-time tests drive it
//! - Timeout errors are distinct from other errors (504, not 502)

use std::time::Duration;

use tokio::time::Instant;

/// Hard upper bound on all attempts plus backoff for one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    at: Instant,
}

impl Deadline {
    /// A deadline `limit` from now.
    pub fn after(limit: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            at: start + limit,
        }
    }

    /// A deadline `limit` from now, tightened to `caller` if that is sooner.
    pub fn bounded(limit: Duration, caller: Option<Instant>) -> Self {
        let mut deadline = Self::after(limit);
        if let Some(caller) = caller {
            deadline.at = deadline.at.min(caller);
        }
        deadline
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Total time this deadline allows.
    pub fn limit(&self) -> Duration {
        self.at.saturating_duration_since(self.start)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Budget for the next attempt.
    pub fn attempt_budget(&self, per_attempt: Duration) -> Duration {
        per_attempt.min(self.remaining())
    }
}
