//! Retry backoff: none, linear, or exponential, with optional cap and jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffKind;

/// Calculate the delay after the given (1-based) failed attempt.
///
/// `linear` waits `base * attempt`, `exponential` waits `base * 2^(attempt-1)`.
/// The cap applies before jitter; jitter adds 0 to 10% of the delay.
pub fn calculate_backoff(
    kind: BackoffKind,
    attempt: u32,
    base_ms: u64,
    max_ms: Option<u64>,
    jitter: bool,
) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let delay_ms = match kind {
        BackoffKind::None => 0,
        BackoffKind::Linear => base_ms.saturating_mul(u64::from(attempt)),
        BackoffKind::Exponential => {
            let exponential_base = 2u64.saturating_pow(attempt - 1);
            base_ms.saturating_mul(exponential_base)
        }
    };
    let capped_delay = max_ms.map_or(delay_ms, |max| delay_ms.min(max));

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter && jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
