//! Client-IP affinity load balancing strategy.

use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::{Candidates, LoadBalancer, ServiceTarget};

/// Maps each client address to a stable position in the healthy set.
///
/// When the mapped target is breaker-blocked the call falls back to round
/// robin over the eligible set. The fallback is not remembered, so the client
/// returns to its target once the breaker lets it through again.
#[derive(Debug, Default)]
pub struct IpHash {
    fallback: RoundRobin,
}

impl IpHash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for IpHash {
    fn select(&self, candidates: &Candidates<'_>, client: Option<IpAddr>) -> Option<Arc<ServiceTarget>> {
        if let Some(ip) = client {
            if !candidates.healthy.is_empty() {
                let index = (hash_ip(&ip) % candidates.healthy.len() as u64) as usize;
                let mapped = &candidates.healthy[index];
                if candidates.is_eligible(mapped) {
                    return Some(mapped.clone());
                }
                tracing::debug!(client = %ip, target = %mapped, "Affinity target excluded, using round robin");
            }
        }
        self.fallback.next_of(candidates.eligible)
    }
}

/// FNV-1a over the address octets.
fn hash_ip(ip: &IpAddr) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let octets: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    octets
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}
