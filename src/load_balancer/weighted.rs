//! Weighted random load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{Candidates, LoadBalancer, ServiceTarget};

/// Draws a target with probability proportional to its weight.
/// Zero-weight targets never win the draw.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }

    fn pick<R: Rng>(
        &self,
        targets: &[Arc<ServiceTarget>],
        rng: &mut R,
    ) -> Option<Arc<ServiceTarget>> {
        // Weights are sampled once so a concurrent change cannot skew the draw.
        let weights: Vec<u64> = targets.iter().map(|t| u64::from(t.weight())).collect();
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return None;
        }

        let mut point = rng.gen_range(0..total);
        for (target, weight) in targets.iter().zip(weights) {
            if point < weight {
                return Some(target.clone());
            }
            point -= weight;
        }
        None
    }
}

impl LoadBalancer for WeightedRandom {
    fn select(&self, candidates: &Candidates<'_>, _client: Option<IpAddr>) -> Option<Arc<ServiceTarget>> {
        self.pick(candidates.eligible, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::targets;

    #[test]
    fn test_proportional() {
        let lb = WeightedRandom::new();
        let backends = targets(3);
        backends[0].set_weight(1);
        backends[1].set_weight(1);
        backends[2].set_weight(2);
        let candidates = Candidates::uniform(&backends);

        let draws = 40_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            let pick = lb.select(&candidates, None).unwrap();
            let i = backends.iter().position(|b| Arc::ptr_eq(b, &pick)).unwrap();
            counts[i] += 1;
        }

        let expected = [draws / 4, draws / 4, draws / 2];
        for (count, want) in counts.iter().zip(expected) {
            let tolerance = want / 10;
            assert!(count.abs_diff(want) <= tolerance, "counts={counts:?}");
        }
    }

    #[test]
    fn test_zero_weight_excluded() {
        let lb = WeightedRandom::new();
        let backends = targets(2);
        backends[0].set_weight(0);
        backends[1].set_weight(3);
        let candidates = Candidates::uniform(&backends);

        for _ in 0..200 {
            assert_eq!(lb.select(&candidates, None).unwrap().key(), backends[1].key());
        }

        backends[1].set_weight(0);
        assert!(lb.select(&candidates, None).is_none());
    }
}
