//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway selects for a service
//!     → pool.rs (current snapshot)
//!     → filter: healthy ∩ breaker-selectable = eligible
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through eligible targets)
//!         - least_conn.rs (fewest in-flight requests)
//!         - ip_hash.rs (client affinity, round-robin fallback)
//!         - weighted.rs (weighted random draw)
//!     → target.rs (in-flight guard held for the attempt)
//! ```
//!
//! # Design Decisions
//! - Algorithms only choose; the pool owns targets and their bookkeeping
//! - One balancer instance per service and algorithm, so cursors are shared
//!   by every route forwarding to that service
//! - Weights are read at selection time, never normalized into storage

use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::LoadBalancerKind;

pub mod ip_hash;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod target;
pub mod weighted;

pub use pool::{PoolSnapshot, TargetPool};
pub use target::{HealthState, InFlightGuard, ServiceTarget};

/// Targets offered to a balancer for one selection.
#[derive(Debug, Clone, Copy)]
pub struct Candidates<'a> {
    /// Healthy targets in snapshot order, breaker state ignored.
    pub healthy: &'a [Arc<ServiceTarget>],
    /// Subset of `healthy` whose breaker admits a request.
    pub eligible: &'a [Arc<ServiceTarget>],
}

impl<'a> Candidates<'a> {
    pub fn new(healthy: &'a [Arc<ServiceTarget>], eligible: &'a [Arc<ServiceTarget>]) -> Self {
        Self { healthy, eligible }
    }

    /// All targets are eligible.
    pub fn uniform(targets: &'a [Arc<ServiceTarget>]) -> Self {
        Self {
            healthy: targets,
            eligible: targets,
        }
    }

    pub fn is_eligible(&self, target: &Arc<ServiceTarget>) -> bool {
        self.eligible.iter().any(|t| Arc::ptr_eq(t, target))
    }
}

/// A target selection algorithm.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick one of `candidates.eligible`, or `None` if there is nothing to pick.
    fn select(&self, candidates: &Candidates<'_>, client: Option<IpAddr>) -> Option<Arc<ServiceTarget>>;
}

/// Build a fresh balancer for the algorithm.
pub fn build(kind: LoadBalancerKind) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::RoundRobin => Arc::new(round_robin::RoundRobin::new()),
        LoadBalancerKind::LeastConnections => Arc::new(least_conn::LeastConnections::new()),
        LoadBalancerKind::IpHash => Arc::new(ip_hash::IpHash::new()),
        LoadBalancerKind::Weighted => Arc::new(weighted::WeightedRandom::new()),
    }
}
