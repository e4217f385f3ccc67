//! Upstream target abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream endpoint of a logical service
//! - Track in-flight requests (for Least Connections LB)
//! - Track health state (Unknown/Healthy/Unhealthy) and consecutive counters
//! - Hold a mutable weight so weight changes need no pool rewrite

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// A single upstream endpoint.
#[derive(Debug)]
pub struct ServiceTarget {
    host: String,
    port: u16,
    weight: AtomicU32,
    metadata: HashMap<String, String>,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    probe_successes: AtomicU32,
    probe_failures: AtomicU32,

    /// Request outcomes, independent of probes.
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,

    /// Requests currently being forwarded to this target. Shared with the
    /// entries this one replaces or is replaced by across refreshes.
    in_flight: Arc<AtomicUsize>,
}

impl ServiceTarget {
    /// Create a new target with weight 1 and unknown health.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: AtomicU32::new(1),
            metadata: HashMap::new(),
            state: AtomicU8::new(HealthState::Unknown as u8),
            probe_successes: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_weight(self, weight: u32) -> Self {
        self.weight.store(weight, Ordering::Relaxed);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Start in a known health state (e.g. catalog reported not-ready).
    pub fn with_health(self, state: HealthState) -> Self {
        self.state.store(state as u8, Ordering::Relaxed);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Identity within a pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URI authority, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.key()
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Healthy or Unknown targets may receive traffic.
    pub fn is_available(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Consecutive failed health probes.
    pub fn probe_failures(&self) -> u32 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    /// Count a request outcome. Only counters move; health is owned by probes.
    pub fn mark(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a probe outcome and flip health once a threshold is reached.
    /// Returns the new state when a transition happened.
    pub fn record_probe(
        &self,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<HealthState> {
        if success {
            self.probe_failures.store(0, Ordering::Relaxed);
            let successes = self.probe_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= healthy_threshold {
                self.transition(HealthState::Healthy)
            } else {
                None
            }
        } else {
            self.probe_successes.store(0, Ordering::Relaxed);
            let failures = self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= unhealthy_threshold {
                self.transition(HealthState::Unhealthy)
            } else {
                None
            }
        }
    }

    fn transition(&self, to: HealthState) -> Option<HealthState> {
        let prev = self.state.swap(to as u8, Ordering::Relaxed);
        (prev != to as u8).then_some(to)
    }

    /// Take over the entry this one replaces: the in-flight counter is
    /// shared, and health bookkeeping is copied unless the resolver already
    /// reported a state for this entry.
    pub(crate) fn inherit(&mut self, previous: &ServiceTarget) {
        self.in_flight = previous.in_flight.clone();
        if self.health() != HealthState::Unknown {
            return;
        }
        self.state.store(previous.state.load(Ordering::Relaxed), Ordering::Relaxed);
        self.probe_successes
            .store(previous.probe_successes.load(Ordering::Relaxed), Ordering::Relaxed);
        self.probe_failures
            .store(previous.probe_failures.load(Ordering::Relaxed), Ordering::Relaxed);
        self.consecutive_successes
            .store(previous.consecutive_successes(), Ordering::Relaxed);
        self.consecutive_failures
            .store(previous.consecutive_failures(), Ordering::Relaxed);
    }

    /// Count a request as in flight until the guard drops.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            target: self.clone(),
        }
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A RAII guard that manages the in-flight request count.
#[derive(Debug)]
pub struct InFlightGuard {
    target: Arc<ServiceTarget>,
}

impl Deref for InFlightGuard {
    type Target = ServiceTarget;
    fn deref(&self) -> &Self::Target {
        &self.target
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.target.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
