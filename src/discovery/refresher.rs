//! Periodic discovery refresh.
//!
//! # Responsibilities
//! - Re-resolve a service on its refresh interval
//! - Swap the pool snapshot on success
//! - Keep the last-good pool on failure
//!
//! # Design Decisions
//! - Single writer per pool: only this loop (and first registration) calls
//!   `TargetPool::update`
//! - The loop exits on the shared shutdown broadcast

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::discovery::{DiscoveryResult, Resolver};
use crate::load_balancer::{PoolSnapshot, TargetPool};
use crate::observability::metrics;

pub struct Refresher {
    resolver: Arc<dyn Resolver>,
    pool: Arc<TargetPool>,
    interval: Duration,
    on_update: Option<Box<dyn Fn(&PoolSnapshot) + Send + Sync>>,
}

impl Refresher {
    pub fn new(resolver: Arc<dyn Resolver>, pool: Arc<TargetPool>, interval: Duration) -> Self {
        Self {
            resolver,
            pool,
            interval,
            on_update: None,
        }
    }

    /// Called with every new snapshot.
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&PoolSnapshot) + Send + Sync + 'static,
    {
        self.on_update = Some(Box::new(f));
        self
    }

    /// Resolve once and swap the pool. On error the pool is left untouched.
    pub async fn refresh(&self) -> DiscoveryResult<u64> {
        let service = self.pool.service().to_string();
        match self.resolver.resolve().await {
            Ok(targets) => {
                let generation = self.pool.update(targets);
                if let (Some(callback), Some(snapshot)) = (&self.on_update, self.pool.snapshot()) {
                    callback(&snapshot);
                }
                metrics::record_discovery_refresh(&service, true);
                Ok(generation)
            }
            Err(e) => {
                metrics::record_discovery_refresh(&service, false);
                tracing::warn!(
                    service = %service,
                    backend = self.resolver.name(),
                    error = %e,
                    generation = self.pool.generation(),
                    "Discovery refresh failed, keeping last-good pool"
                );
                Err(e)
            }
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            service = %self.pool.service(),
            backend = self.resolver.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Discovery refresher starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // First resolution already happened at registration.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.refresh().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(service = %self.pool.service(), "Discovery refresher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
