//! Failure injection tests for the gateway.

use std::time::Duration;

use axum::http::{header, StatusCode};
use tokio::time::Instant;

use proxy_gateway::config::{BackoffKind, HealthCheckConfig};
use proxy_gateway::load_balancer::HealthState;
use proxy_gateway::{Gateway, GatewayError};

mod common;
use common::{body_string, closed_port, directive, get, start_mock_backend, start_programmable_backend, Reply};

#[tokio::test]
async fn test_retry_on_failure() {
    let backend = start_programmable_backend(|index, _| {
        if index < 2 {
            Reply::status(503)
        } else {
            Reply::ok("Success")
        }
    })
    .await;

    let gateway = Gateway::new();
    let response = gateway.forward(get("/"), &directive(&[backend.spec()])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-proxy-instance"], backend.spec().as_str());
    assert_eq!(response.headers()["x-proxy-circuit-breaker"], "closed");
    assert_eq!(body_string(response).await, "Success");
    assert_eq!(backend.hits(), 3);
}

#[tokio::test]
async fn test_attempts_never_exceed_limit() {
    let backend = start_mock_backend(Reply::status(502)).await;
    let gateway = Gateway::new();

    let err = gateway.forward(get("/"), &directive(&[backend.spec()])).await.unwrap_err();
    match err {
        GatewayError::UpstreamStatus { status, response, .. } => {
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert_eq!(body_string(response).await, "status 502");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.hits(), 3);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let backend = start_mock_backend(Reply::status(404)).await;
    let gateway = Gateway::new();
    let mut directive = directive(&[backend.spec()]);
    directive.retry.attempts = 5;

    let response = gateway.handle(get("/missing"), &directive).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, "status 404");
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn test_dead_target_skipped_on_retry() {
    let dead = closed_port().await;
    let live = start_mock_backend(Reply::ok("alive")).await;
    let gateway = Gateway::new();
    let directive = directive(&[dead.to_string(), live.spec()]);

    for _ in 0..4 {
        let response = gateway.forward(get("/"), &directive).await.unwrap();
        assert_eq!(body_string(response).await, "alive");
    }
    assert_eq!(live.hits(), 4);
}

#[tokio::test]
async fn test_unreachable_is_bad_gateway() {
    let dead = closed_port().await;
    let gateway = Gateway::new();
    let mut directive = directive(&[dead.to_string()]);
    directive.retry.attempts = 2;

    let response = gateway.handle(get("/"), &directive).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(body_string(response).await.contains("upstream_unreachable"));
}

#[tokio::test]
async fn test_circuit_opens_and_fails_fast() {
    let backend = start_mock_backend(Reply::status(500)).await;
    let gateway = Gateway::new();
    let mut directive = directive(&[backend.spec()]);
    directive.retry.attempts = 1;
    directive.circuit_breaker.failure_threshold = 2;
    directive.circuit_breaker.recovery_timeout_ms = 30_000;

    for _ in 0..2 {
        let response = gateway.handle(get("/"), &directive).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(backend.hits(), 2);

    let response = gateway.handle(get("/"), &directive).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((29..=30).contains(&retry_after));
    assert!(body_string(response).await.contains("circuit_open"));
    assert_eq!(backend.hits(), 2, "open breaker must not reach the upstream");
}

#[tokio::test]
async fn test_circuit_recovers_after_timeout() {
    let backend = start_programmable_backend(|index, _| {
        if index == 0 {
            Reply::status(500)
        } else {
            Reply::ok("recovered")
        }
    })
    .await;
    let gateway = Gateway::new();
    let mut directive = directive(&[backend.spec()]);
    directive.retry.attempts = 1;
    directive.circuit_breaker.failure_threshold = 1;
    directive.circuit_breaker.recovery_timeout_ms = 200;

    gateway.handle(get("/"), &directive).await;
    let blocked = gateway.handle(get("/"), &directive).await;
    assert_eq!(blocked.status(), StatusCode::SERVICE_UNAVAILABLE);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = gateway.forward(get("/"), &directive).await.unwrap();
    assert_eq!(response.headers()["x-proxy-circuit-breaker"], "closed");
    assert_eq!(body_string(response).await, "recovered");
}

#[tokio::test]
async fn test_attempt_timeout() {
    let backend = start_mock_backend(Reply::ok("slow").delayed(Duration::from_millis(500))).await;
    let gateway = Gateway::new();
    let mut directive = directive(&[backend.spec()]);
    directive.retry.attempts = 1;
    directive.timeout_ms = 100;

    let err = gateway.forward(get("/"), &directive).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout(_)));
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_deadline_bounds_all_attempts() {
    let backend = start_mock_backend(Reply::ok("slow").delayed(Duration::from_millis(400))).await;
    let gateway = Gateway::new();
    let mut directive = directive(&[backend.spec()]);
    directive.retry.attempts = 5;
    directive.retry.backoff = BackoffKind::Linear;
    directive.retry.base_delay_ms = 50;
    directive.timeout_ms = 100;
    directive.deadline_ms = 250;

    let start = Instant::now();
    let err = gateway.forward(get("/"), &directive).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout(_)));
    assert!(start.elapsed() < Duration::from_millis(400));
    assert!(backend.hits() <= 2);
}

#[tokio::test]
async fn test_health_check_evicts_target() {
    let sick = start_programmable_backend(|_, request| {
        if request.path() == "/health" {
            Reply::status(500)
        } else {
            Reply::ok("sick")
        }
    })
    .await;
    let healthy = start_mock_backend(Reply::ok("healthy")).await;

    let gateway = Gateway::new();
    let mut directive = directive(&[sick.spec(), healthy.spec()]);
    directive.health_check = HealthCheckConfig {
        path: Some("/health".to_string()),
        interval_ms: 50,
        timeout_ms: 500,
        healthy_threshold: 1,
        unhealthy_threshold: 2,
    };

    let service = gateway.register(&directive).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snapshot = service.pool().snapshot().unwrap();
    assert_eq!(snapshot.get(&sick.spec()).unwrap().health(), HealthState::Unhealthy);
    assert_eq!(snapshot.get(&healthy.spec()).unwrap().health(), HealthState::Healthy);

    for _ in 0..6 {
        let response = gateway.forward(get("/"), &directive).await.unwrap();
        assert_eq!(body_string(response).await, "healthy");
    }
    assert_eq!(sick.hits(), 0);
    gateway.shutdown();
}

#[tokio::test]
async fn test_cancellation_stops_request() {
    let backend = start_mock_backend(Reply::ok("late").delayed(Duration::from_secs(2))).await;
    let gateway = Gateway::new();
    let directive = directive(&[backend.spec()]);

    let ctx = get("/");
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let response = gateway.handle(ctx, &directive).await;
    assert_eq!(response.status().as_u16(), 499);
    assert!(start.elapsed() < Duration::from_secs(1));
}
