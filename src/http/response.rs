//! Response handling for terminal gateway errors.
//!
//! # Responsibilities
//! - Map the error taxonomy to an HTTP status
//! - Relay upstream 4xx/5xx responses untouched
//! - Render everything else as a small JSON diagnostic body
//!
//! # Design Decisions
//! - No internal detail beyond the error's display text
//! - Circuit-open answers carry `Retry-After` in whole seconds (at least 1)

use axum::body::Body;
use axum::http::{header, HeaderValue, Response};
use axum::response::IntoResponse;
use serde_json::json;

use crate::error::GatewayError;
use crate::http::request::X_REQUEST_ID;

/// Turn a terminal error into the response sent to the caller.
pub fn error_response(err: GatewayError, request_id: Option<&str>) -> Response<Body> {
    let status = err.status_code();
    let kind = err.kind();
    let retry_after = match &err {
        GatewayError::CircuitOpen { retry_after, .. } => {
            Some(retry_after.as_millis().div_ceil(1000).max(1) as u64)
        }
        _ => None,
    };

    let mut response = match err {
        GatewayError::UpstreamStatus { response, .. } | GatewayError::Client { response, .. } => {
            response
        }
        other => {
            let body = json!({
                "error": kind,
                "message": other.to_string(),
                "request_id": request_id,
            });
            let mut response = Response::new(Body::from(body.to_string()));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
    };

    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().entry(X_REQUEST_ID.clone()).or_insert(id);
    }
    response
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        error_response(self, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::time::Duration;

    async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_circuit_open_has_retry_after() {
        let err = GatewayError::CircuitOpen {
            service: "users".into(),
            retry_after: Duration::from_millis(1_200),
        };
        let response = error_response(err, Some("req-9"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        assert_eq!(response.headers()["x-request-id"], "req-9");

        let body = json_body(response).await;
        assert_eq!(body["error"], "circuit_open");
        assert_eq!(body["request_id"], "req-9");
    }

    #[tokio::test]
    async fn test_short_retry_after_rounds_up() {
        let err = GatewayError::CircuitOpen {
            service: "users".into(),
            retry_after: Duration::from_millis(10),
        };
        let response = err.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn test_upstream_response_relayed() {
        let mut upstream = Response::new(Body::from("not here"));
        *upstream.status_mut() = StatusCode::NOT_FOUND;
        upstream.headers_mut().insert("x-upstream", HeaderValue::from_static("yes"));

        let err = GatewayError::Client {
            target: "10.0.0.1:80".into(),
            status: StatusCode::NOT_FOUND,
            response: upstream,
        };
        let response = error_response(err, None);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-upstream"], "yes");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"not here");
    }

    #[tokio::test]
    async fn test_timeout_body() {
        let response = error_response(GatewayError::UpstreamTimeout(Duration::from_secs(1)), None);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = json_body(response).await;
        assert_eq!(body["error"], "upstream_timeout");
        assert!(body["request_id"].is_null());
    }
}
