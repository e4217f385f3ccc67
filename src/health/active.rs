//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe the targets of one pool
//! - Update target health state based on results

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request};
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::load_balancer::{HealthState, ServiceTarget, TargetPool};
use crate::observability::metrics;

pub struct HealthChecker {
    pool: Arc<TargetPool>,
    config: HealthCheckConfig,
    path: String,
    client: Client<HttpConnector, Body>,
}

impl HealthChecker {
    /// Returns `None` when the config has no probe path.
    pub fn new(pool: Arc<TargetPool>, config: HealthCheckConfig) -> Option<Self> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self::with_client(pool, config, client)
    }

    pub fn with_client(
        pool: Arc<TargetPool>,
        config: HealthCheckConfig,
        client: Client<HttpConnector, Body>,
    ) -> Option<Self> {
        let path = config.path.clone()?;
        Some(Self {
            pool,
            config,
            path,
            client,
        })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            service = %self.pool.service(),
            interval_ms = self.config.interval_ms,
            path = %self.path,
            "Health checker starting"
        );

        let mut ticker = time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(service = %self.pool.service(), "Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every target of the current snapshot once, concurrently.
    ///
    /// Results are recorded by key against the pool as it is when the probes
    /// finish, since a refresh may have swapped the snapshot meanwhile.
    pub async fn check_all(&self) {
        let Some(snapshot) = self.pool.snapshot() else {
            return;
        };

        let probes = snapshot.targets.iter().map(|target| async move {
            let healthy = self.probe(target).await;
            (target.key(), healthy)
        });

        for (key, healthy) in join_all(probes).await {
            let Some((target, transition)) = self.pool.record_probe(
                &key,
                healthy,
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            ) else {
                tracing::debug!(service = %self.pool.service(), target = %key, "Target left the pool during probe");
                continue;
            };
            match transition {
                Some(HealthState::Unhealthy) => tracing::warn!(
                    service = %self.pool.service(),
                    target = %target,
                    failures = target.probe_failures(),
                    "Target marked unhealthy"
                ),
                Some(state) => tracing::info!(
                    service = %self.pool.service(),
                    target = %target,
                    state = %state,
                    "Target health changed"
                ),
                None => {}
            }
            metrics::record_target_health(self.pool.service(), &key, target.is_available());
        }
    }

    async fn probe(&self, target: &ServiceTarget) -> bool {
        let uri = format!("http://{}{}", target.authority(), self.path);
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::USER_AGENT, "proxy-gateway-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "Failed to build health check request");
                return false;
            }
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::debug!(target = %target, status = %response.status(), "Health probe failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::debug!(target = %target, error = %e, "Health probe failed: connection error");
                false
            }
            Err(_) => {
                tracing::debug!(target = %target, "Health probe failed: timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Backend that answers every request with 500 after `delay`.
    async fn failing_backend(delay: Duration) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    time::sleep(delay).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });
        addr
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            path: Some("/health".to_string()),
            interval_ms: 1_000,
            timeout_ms: 2_000,
            healthy_threshold: 1,
            unhealthy_threshold: 1,
        }
    }

    #[test]
    fn test_disabled_without_path() {
        let pool = Arc::new(TargetPool::new("users"));
        assert!(HealthChecker::new(pool, HealthCheckConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_failed_check_marks_unhealthy() {
        let addr = failing_backend(Duration::ZERO).await;
        let pool = Arc::new(TargetPool::new("users"));
        pool.update(vec![ServiceTarget::new(addr.ip().to_string(), addr.port())]);

        let checker = HealthChecker::new(pool.clone(), config()).unwrap();
        checker.check_all().await;

        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.get(&addr.to_string()).unwrap().health(), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_check_result_survives_refresh() {
        let addr = failing_backend(Duration::from_millis(200)).await;
        let target = move || ServiceTarget::new(addr.ip().to_string(), addr.port());
        let pool = Arc::new(TargetPool::new("users"));
        pool.update(vec![target()]);

        let checker = HealthChecker::new(pool.clone(), config()).unwrap();
        let refresh = {
            let pool = pool.clone();
            async move {
                time::sleep(Duration::from_millis(50)).await;
                pool.update(vec![target()]);
            }
        };
        tokio::join!(checker.check_all(), refresh);

        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.get(&addr.to_string()).unwrap().health(), HealthState::Unhealthy);
    }
}
