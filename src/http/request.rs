//! Inbound request context.
//!
//! # Responsibilities
//! - Carry everything the gateway needs from the inbound request
//! - Assign a request ID as early as possible (reuse `x-request-id`)
//! - Carry the caller's cancellation signal and optional deadline
//!
//! # Design Decisions
//! - The body is moved in, never cloned; replay buffering is decided later
//! - Cancellation is a `CancellationToken` so it can be tied to the
//!   lifetime of the serving task

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Method, Request, Uri, Version};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Header used to propagate correlation IDs.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// One inbound request as seen by [`Gateway::forward`](crate::gateway::Gateway::forward).
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub client_addr: Option<SocketAddr>,
    /// Values captured by `{name}` segments of the matched route.
    pub path_params: HashMap<String, String>,
    /// Fires when the caller goes away.
    pub cancel: CancellationToken,
    /// Caller-imposed deadline, tightened with the directive's own.
    pub deadline: Option<Instant>,
    pub request_id: String,
}

impl RequestContext {
    pub fn from_request(request: Request<Body>) -> Self {
        let (parts, body) = request.into_parts();
        let request_id = parts
            .headers
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            client_addr: None,
            path_params: HashMap::new(),
            cancel: CancellationToken::new(),
            deadline: None,
            request_id,
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_path_params(mut self, params: HashMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }
}
