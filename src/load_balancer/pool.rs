//! Target pool management.
//!
//! # Responsibilities
//! - Hold the current resolved target set for one logical service
//! - Swap the set atomically on refresh (copy-on-write, readers never block)
//! - Carry health bookkeeping across refreshes for targets that survive
//! - Route health/outcome bookkeeping to the right target by identity

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::load_balancer::target::{HealthState, ServiceTarget};

/// An immutable view of the pool at one generation.
#[derive(Debug)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub targets: Vec<Arc<ServiceTarget>>,
}

impl PoolSnapshot {
    pub fn get(&self, key: &str) -> Option<&Arc<ServiceTarget>> {
        self.targets.iter().find(|t| t.key() == key)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

/// Current target set of one logical service.
///
/// Until the first [`update`](TargetPool::update) the pool is unresolved,
/// which is distinct from resolved-to-empty.
#[derive(Debug)]
pub struct TargetPool {
    service: String,
    current: ArcSwapOption<PoolSnapshot>,
}

impl TargetPool {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            current: ArcSwapOption::empty(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The current snapshot, or `None` if never resolved.
    pub fn snapshot(&self) -> Option<Arc<PoolSnapshot>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().map_or(0, |s| s.generation)
    }

    /// Replace the target set. Duplicate keys keep their first occurrence.
    /// Targets present in the previous generation keep their health state,
    /// counters, and in-flight count.
    pub fn update(&self, targets: Vec<ServiceTarget>) -> u64 {
        let previous = self.current.load_full();
        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(targets.len());

        for mut target in targets {
            if !seen.insert(target.key()) {
                tracing::debug!(service = %self.service, target = %target, "Dropping duplicate target");
                continue;
            }
            if let Some(old) = previous.as_ref().and_then(|p| p.get(&target.key())) {
                target.inherit(old);
            }
            next.push(Arc::new(target));
        }

        let generation = previous.as_ref().map_or(1, |p| p.generation + 1);
        tracing::debug!(
            service = %self.service,
            generation,
            targets = next.len(),
            "Target pool updated"
        );
        self.current.store(Some(Arc::new(PoolSnapshot {
            generation,
            targets: next,
        })));
        generation
    }

    /// Count a request outcome against the target with this key.
    pub fn mark(&self, key: &str, success: bool) {
        if let Some(target) = self.snapshot().as_deref().and_then(|s| s.get(key)) {
            target.mark(success);
        }
    }

    /// Count a probe outcome against the live entry for `key`, so a result
    /// that arrives after a refresh lands on the current snapshot. Returns the
    /// live target and the new health state on a transition, or `None` when
    /// the key has left the pool.
    pub fn record_probe(
        &self,
        key: &str,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<(Arc<ServiceTarget>, Option<HealthState>)> {
        let snapshot = self.snapshot()?;
        let target = snapshot.get(key)?.clone();
        let transition = target.record_probe(success, healthy_threshold, unhealthy_threshold);
        Some((target, transition))
    }

    /// Change a target's weight in place. Returns false for unknown keys.
    pub fn set_weight(&self, key: &str, weight: u32) -> bool {
        let snapshot = self.snapshot();
        match snapshot.as_deref().and_then(|s| s.get(key)) {
            Some(target) => {
                target.set_weight(weight);
                true
            }
            None => false,
        }
    }
}
