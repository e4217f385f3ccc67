//! Least Connections load balancing strategy.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{Candidates, LoadBalancer, ServiceTarget};

/// Least connections selector.
/// Selects the target with the fewest in-flight requests. Ties rotate
/// through a cursor so idle pools do not herd onto the first target.
#[derive(Debug, Default)]
pub struct LeastConnections {
    cursor: AtomicUsize,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, candidates: &Candidates<'_>, _client: Option<IpAddr>) -> Option<Arc<ServiceTarget>> {
        let min = candidates.eligible.iter().map(|t| t.in_flight()).min()?;
        let tied: Vec<&Arc<ServiceTarget>> = candidates
            .eligible
            .iter()
            .filter(|t| t.in_flight() == min)
            .collect();

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
        Some(tied[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::targets;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let backends = targets(2);
        let candidates = Candidates::uniform(&backends);

        // artificially increase in-flight on b1
        let _g1 = backends[0].begin_request();

        // Should pick b2 (0 in flight)
        let s1 = lb.select(&candidates, None).unwrap();
        assert_eq!(s1.key(), backends[1].key());

        let _g2 = backends[1].begin_request();
        let _g3 = backends[1].begin_request();

        // Should pick b1 (1 in flight vs 2)
        let s2 = lb.select(&candidates, None).unwrap();
        assert_eq!(s2.key(), backends[0].key());
    }

    #[test]
    fn test_ties_rotate() {
        let lb = LeastConnections::new();
        let backends = targets(3);
        let candidates = Candidates::uniform(&backends);

        let picks: Vec<String> = (0..3)
            .map(|_| lb.select(&candidates, None).unwrap().key())
            .collect();
        assert_eq!(picks, backends.iter().map(|b| b.key()).collect::<Vec<_>>());
    }
}
