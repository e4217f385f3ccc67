//! Circuit breaker for target protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: target assumed broken, requests fail fast
//! - Half-Open: a single trial request decides whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive failures
//! Open → Half-Open: first caller after the recovery timeout claims the trial
//! Half-Open → Closed: trial succeeds
//! Half-Open → Open: trial fails (timer restarts, timeout may grow)
//! ```
//!
//! # Design Decisions
//! - Per-target circuit breaker by default, per-service on request
//! - Fail fast in Open state (no network call)
//! - State and open timestamp share one atomic word, so claiming the trial
//!   slot is a single compare-and-set
//! - Outcomes are reported through a [`BreakerPermit`]; a trial permit
//!   dropped without an outcome hands the slot back
//! - Normal permits carry the closed window they were issued in; outcomes
//!   from a window that has since ended are ignored

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::{BreakerScope, CircuitBreakerConfig};
use crate::observability::metrics;

const STATE_SHIFT: u32 = 62;
const TIME_MASK: u64 = (1 << STATE_SHIFT) - 1;

/// Circuit breaker state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pack(state: BreakerState, opened_ms: u64) -> u64 {
    ((state as u64) << STATE_SHIFT) | (opened_ms & TIME_MASK)
}

fn unpack(word: u64) -> (BreakerState, u64) {
    let state = match word >> STATE_SHIFT {
        1 => BreakerState::Open,
        2 => BreakerState::HalfOpen,
        _ => BreakerState::Closed,
    };
    (state, word & TIME_MASK)
}

const CLOSED: u64 = 0;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// How long ago the breaker last opened, while not Closed.
    pub opened_for: Option<Duration>,
    pub recovery_timeout: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    base_recovery_ms: u64,
    max_recovery_ms: u64,
    backoff_multiplier: f64,

    epoch: Instant,
    word: AtomicU64,
    /// Bumped every time the breaker leaves Closed.
    window: AtomicU64,
    failures: AtomicU32,
    recovery_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let base_recovery_ms = config.recovery_timeout_ms.max(1);
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            base_recovery_ms,
            max_recovery_ms: config.max_recovery_timeout_ms.max(base_recovery_ms),
            backoff_multiplier: config.recovery_backoff_multiplier.max(1.0),
            epoch: Instant::now(),
            word: AtomicU64::new(CLOSED),
            window: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            recovery_ms: AtomicU64::new(base_recovery_ms),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> BreakerState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_ms.load(Ordering::Acquire))
    }

    /// Time left before an Open breaker allows a trial.
    fn open_remaining(&self, opened_ms: u64) -> Duration {
        let elapsed = self.now_ms().saturating_sub(opened_ms);
        let recovery = self.recovery_ms.load(Ordering::Acquire);
        Duration::from_millis(recovery.saturating_sub(elapsed))
    }

    /// Whether a call to [`try_acquire`](Self::try_acquire) could succeed now.
    pub fn is_selectable(&self) -> bool {
        match unpack(self.word.load(Ordering::Acquire)) {
            (BreakerState::Closed, _) => true,
            (BreakerState::Open, opened) => self.open_remaining(opened).is_zero(),
            (BreakerState::HalfOpen, _) => false,
        }
    }

    /// Hint for how long a caller should wait before trying again.
    pub fn retry_after(&self) -> Duration {
        match unpack(self.word.load(Ordering::Acquire)) {
            (BreakerState::Closed, _) => Duration::ZERO,
            (BreakerState::Open, opened) => self.open_remaining(opened),
            (BreakerState::HalfOpen, _) => self.recovery_timeout(),
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let (state, opened_ms) = unpack(self.word.load(Ordering::Acquire));
        BreakerStats {
            state,
            consecutive_failures: self.failures.load(Ordering::Acquire),
            opened_for: (state != BreakerState::Closed)
                .then(|| Duration::from_millis(self.now_ms().saturating_sub(opened_ms))),
            recovery_timeout: self.recovery_timeout(),
        }
    }

    /// Ask to send one request. On refusal, returns the retry-after hint.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Duration> {
        loop {
            // Window before word: a permit never claims a window newer than
            // the Closed state it observed.
            let window = self.window.load(Ordering::Acquire);
            let word = self.word.load(Ordering::Acquire);
            match unpack(word) {
                (BreakerState::Closed, _) => {
                    return Ok(BreakerPermit::new(self.clone(), PermitKind::Normal, window));
                }
                (BreakerState::HalfOpen, _) => return Err(self.recovery_timeout()),
                (BreakerState::Open, opened) => {
                    let remaining = self.open_remaining(opened);
                    if !remaining.is_zero() {
                        return Err(remaining);
                    }
                    let claimed = pack(BreakerState::HalfOpen, opened);
                    if self
                        .word
                        .compare_exchange(word, claimed, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.log_transition(BreakerState::Open, BreakerState::HalfOpen);
                        return Ok(BreakerPermit::new(self.clone(), PermitKind::Trial, claimed));
                    }
                    // Lost the race; re-read and most likely fail fast.
                }
            }
        }
    }

    fn is_stale(&self, window: u64) -> bool {
        let stale = self.window.load(Ordering::Acquire) != window;
        if stale {
            tracing::trace!(breaker = %self.name, "Ignoring outcome from an earlier closed window");
        }
        stale
    }

    fn on_success(&self, kind: PermitKind, claimed: u64) -> BreakerState {
        match kind {
            PermitKind::Normal => {
                if !self.is_stale(claimed) {
                    self.failures.store(0, Ordering::Release);
                }
            }
            PermitKind::Trial => {
                if self
                    .word
                    .compare_exchange(claimed, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    self.recovery_ms.store(self.base_recovery_ms, Ordering::Release);
                    self.log_transition(BreakerState::HalfOpen, BreakerState::Closed);
                }
            }
        }
        self.state()
    }

    fn on_failure(&self, kind: PermitKind, claimed: u64) -> BreakerState {
        match kind {
            PermitKind::Normal => {
                if self.is_stale(claimed) {
                    return self.state();
                }
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    let opened = pack(BreakerState::Open, self.now_ms());
                    if self
                        .word
                        .compare_exchange(CLOSED, opened, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.window.fetch_add(1, Ordering::AcqRel);
                        self.log_transition(BreakerState::Closed, BreakerState::Open);
                    }
                }
            }
            PermitKind::Trial => {
                let current = self.recovery_ms.load(Ordering::Acquire);
                let grown = ((current as f64) * self.backoff_multiplier) as u64;
                let reopened = pack(BreakerState::Open, self.now_ms());
                if self
                    .word
                    .compare_exchange(claimed, reopened, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.recovery_ms
                        .store(grown.clamp(self.base_recovery_ms, self.max_recovery_ms), Ordering::Release);
                    self.log_transition(BreakerState::HalfOpen, BreakerState::Open);
                }
            }
        }
        self.state()
    }

    /// Trial abandoned: back to Open with the original timestamp so the next
    /// caller can claim a new trial immediately.
    fn on_abandon(&self, claimed: u64) {
        let (_, opened) = unpack(claimed);
        if self
            .word
            .compare_exchange(
                claimed,
                pack(BreakerState::Open, opened),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::debug!(breaker = %self.name, "Half-open trial abandoned");
        }
    }

    fn log_transition(&self, from: BreakerState, to: BreakerState) {
        match to {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                recovery_ms = self.recovery_ms.load(Ordering::Acquire),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker transition"),
        }
        metrics::record_breaker_transition(&self.name, to.as_str());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Permission to send one request through a breaker. Report the outcome with
/// [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure).
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    kind: PermitKind,
    /// Closed window for normal permits, the claimed half-open word for trials.
    claimed: u64,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, kind: PermitKind, claimed: u64) -> Self {
        Self {
            breaker,
            kind,
            claimed,
            settled: false,
        }
    }

    /// True for the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn record_success(mut self) -> BreakerState {
        self.settled = true;
        self.breaker.on_success(self.kind, self.claimed)
    }

    pub fn record_failure(mut self) -> BreakerState {
        self.settled = true;
        self.breaker.on_failure(self.kind, self.claimed)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Trial {
            self.breaker.on_abandon(self.claimed);
        }
    }
}

/// Breakers of one service, keyed by target or shared pool-wide.
#[derive(Debug)]
pub struct BreakerRegistry {
    service: String,
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            breakers: DashMap::new(),
        }
    }

    fn slot(&self, target_key: &str) -> String {
        match self.config.scope {
            BreakerScope::PerTarget => target_key.to_string(),
            BreakerScope::PerService => "*".to_string(),
        }
    }

    /// Breaker guarding the target, created Closed on first use.
    pub fn breaker_for(&self, target_key: &str) -> Arc<CircuitBreaker> {
        let slot = self.slot(target_key);
        self.breakers
            .entry(slot)
            .or_insert_with(|| {
                let name = match self.config.scope {
                    BreakerScope::PerTarget => target_key.to_string(),
                    BreakerScope::PerService => self.service.clone(),
                };
                Arc::new(CircuitBreaker::new(name, &self.config))
            })
            .clone()
    }

    /// Drop breakers of targets no longer in the pool.
    pub fn retain_targets<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        if self.config.scope == BreakerScope::PerService {
            return;
        }
        let keep: std::collections::HashSet<&str> = keys.into_iter().collect();
        self.breakers.retain(|key, _| keep.contains(key.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    fn config(threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_ms: recovery_ms,
            ..CircuitBreakerConfig::default()
        }
    }

    fn fail(breaker: &Arc<CircuitBreaker>) -> BreakerState {
        breaker.try_acquire().unwrap().record_failure()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_at_threshold() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(3, 1_000)));

        assert_eq!(fail(&breaker), BreakerState::Closed);
        assert_eq!(fail(&breaker), BreakerState::Closed);
        assert_eq!(fail(&breaker), BreakerState::Open);

        let retry_after = breaker.try_acquire().unwrap_err();
        assert!(retry_after <= Duration::from_millis(1_000));
        assert!(!breaker.is_selectable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(2, 1_000)));
        fail(&breaker);
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(fail(&breaker), BreakerState::Closed);
        assert_eq!(fail(&breaker), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(1, 500)));
        fail(&breaker);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        assert_eq!(trial.record_success(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_from_before_reopen_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(2, 100)));
        let slow = breaker.try_acquire().unwrap();
        let slow_success = breaker.try_acquire().unwrap();

        fail(&breaker);
        assert_eq!(fail(&breaker), BreakerState::Open);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(breaker.try_acquire().unwrap().record_success(), BreakerState::Closed);

        // Issued before the breaker opened; must not count in the new window.
        assert_eq!(slow.record_failure(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);

        assert_eq!(fail(&breaker), BreakerState::Closed);
        slow_success.record_success();
        assert_eq!(breaker.stats().consecutive_failures, 1);
        assert_eq!(fail(&breaker), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_backoff() {
        let mut cfg = config(1, 100);
        cfg.recovery_backoff_multiplier = 2.0;
        cfg.max_recovery_timeout_ms = 300;
        let breaker = Arc::new(CircuitBreaker::new("a:80", &cfg));
        fail(&breaker);

        for expected in [200u64, 300, 300] {
            tokio::time::advance(breaker.recovery_timeout()).await;
            assert_eq!(fail(&breaker), BreakerState::Open);
            assert_eq!(breaker.recovery_timeout(), Duration::from_millis(expected));
        }

        tokio::time::advance(breaker.recovery_timeout()).await;
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(breaker.recovery_timeout(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_returns_slot() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(1, 100)));
        fail(&breaker);
        tokio::time::advance(Duration::from_millis(100)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_single_trial_under_contention() {
        let breaker = Arc::new(CircuitBreaker::new("a:80", &config(1, 20)));
        fail(&breaker);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let callers = 32;
        let barrier = Arc::new(Barrier::new(callers));
        let granted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..callers {
            let breaker = breaker.clone();
            let barrier = barrier.clone();
            let granted = granted.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if let Ok(permit) = breaker.try_acquire() {
                    granted.fetch_add(1, Ordering::SeqCst);
                    // Hold the slot until every caller has tried.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    permit.record_success();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_scope() {
        let per_target = BreakerRegistry::new("users", config(1, 100));
        let a = per_target.breaker_for("a:80");
        let b = per_target.breaker_for("b:80");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &per_target.breaker_for("a:80")));

        per_target.retain_targets(["b:80"]);
        assert!(!Arc::ptr_eq(&a, &per_target.breaker_for("a:80")));

        let mut cfg = config(1, 100);
        cfg.scope = BreakerScope::PerService;
        let shared = BreakerRegistry::new("users", cfg);
        assert!(Arc::ptr_eq(&shared.breaker_for("a:80"), &shared.breaker_for("b:80")));
        assert_eq!(shared.breaker_for("a:80").name(), "users");
    }
}
