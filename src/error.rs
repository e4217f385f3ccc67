//! Gateway error taxonomy.
//!
//! Every terminal failure of a forwarded request is one of these kinds. The
//! enclosing framework only ever sees a `GatewayError` (or the HTTP response
//! rendered from one), so it can log and trace without touching pool,
//! health, or breaker internals.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use thiserror::Error;

use crate::discovery::DiscoveryError;

/// Status used when the caller went away before a response was produced.
/// Not an IANA status; mirrors the nginx convention.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors surfaced by [`Gateway::forward`](crate::gateway::Gateway::forward).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Discovery backend unreachable, misconfigured, or not yet resolved.
    #[error("service discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Every pool member is unhealthy (or the pool is empty).
    #[error("no healthy targets available for {service}")]
    NoHealthyTargets { service: String },

    /// The only viable targets have open breakers.
    #[error("circuit open for {service}, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    /// Per-attempt timeout or overall deadline exceeded.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// Upstream answered with a 5xx. The response is kept so it can be
    /// relayed as-is once attempts are exhausted.
    #[error("upstream {target} returned {status}")]
    UpstreamStatus {
        target: String,
        status: StatusCode,
        response: Response<Body>,
    },

    /// Upstream answered with a 4xx. Never retried.
    #[error("upstream {target} rejected the request with {status}")]
    Client {
        target: String,
        status: StatusCode,
        response: Response<Body>,
    },

    /// Connection-level failure talking to the upstream.
    #[error("upstream {target} unreachable: {message}")]
    Upstream { target: String, message: String },

    /// The inbound caller cancelled or disconnected.
    #[error("request cancelled by caller")]
    Cancelled,

    /// The inbound request body could not be read.
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    /// Invalid directive. Raised at route registration, not per request.
    #[error("invalid proxy directive: {0}")]
    Configuration(String),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Whether the Retry Executor may try another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout(_)
                | GatewayError::UpstreamStatus { .. }
                | GatewayError::Upstream { .. }
        )
    }

    /// Failures raised while picking a target, before any network call.
    pub fn is_selection_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Discovery(_)
                | GatewayError::NoHealthyTargets { .. }
                | GatewayError::CircuitOpen { .. }
        )
    }

    /// Stable classification string for logs and diagnostic bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Discovery(_) => "discovery_error",
            GatewayError::NoHealthyTargets { .. } => "no_healthy_targets",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::UpstreamStatus { .. } => "upstream_status",
            GatewayError::Client { .. } => "client_error",
            GatewayError::Upstream { .. } => "upstream_unreachable",
            GatewayError::Cancelled => "cancelled",
            GatewayError::RequestBody(_) => "request_body_error",
            GatewayError::Configuration(_) => "configuration_error",
        }
    }

    /// HTTP status the gateway answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Discovery(_)
            | GatewayError::NoHealthyTargets { .. }
            | GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamStatus { status, .. } | GatewayError::Client { status, .. } => *status,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::RequestBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
