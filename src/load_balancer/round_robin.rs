//! Round-robin load balancing strategy.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{Candidates, LoadBalancer, ServiceTarget};

/// Round-robin selector.
/// Stores an internal counter to rotate through eligible targets. The counter
/// is not tied to target identity, so pool changes need no reset.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next element of `targets` in rotation.
    pub fn next_of(&self, targets: &[Arc<ServiceTarget>]) -> Option<Arc<ServiceTarget>> {
        if targets.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(targets[index].clone())
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &Candidates<'_>, _client: Option<IpAddr>) -> Option<Arc<ServiceTarget>> {
        self.next_of(candidates.eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::targets;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let backends = targets(2);
        let candidates = Candidates::uniform(&backends);

        let s1 = lb.select(&candidates, None).unwrap();
        assert_eq!(s1.key(), backends[0].key());

        let s2 = lb.select(&candidates, None).unwrap();
        assert_eq!(s2.key(), backends[1].key());

        let s3 = lb.select(&candidates, None).unwrap();
        assert_eq!(s3.key(), backends[0].key());
    }

    #[test]
    fn test_even_distribution() {
        for k in 1..=7u16 {
            for n in [0usize, 1, 5, 13, 100, 101] {
                let lb = RoundRobin::new();
                let backends = targets(k);
                let candidates = Candidates::uniform(&backends);

                let mut counts: HashMap<String, usize> = HashMap::new();
                for _ in 0..n {
                    let t = lb.select(&candidates, None).unwrap();
                    *counts.entry(t.key()).or_default() += 1;
                }

                let floor = n / k as usize;
                let ceil = n.div_ceil(k as usize);
                for b in &backends {
                    let c = counts.get(&b.key()).copied().unwrap_or(0);
                    assert!(c == floor || c == ceil, "k={k} n={n} count={c}");
                }
            }
        }
    }

    #[test]
    fn test_empty() {
        let lb = RoundRobin::new();
        assert!(lb.select(&Candidates::uniform(&[]), None).is_none());
    }
}
