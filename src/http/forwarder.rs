//! Proxy forwarder: one outbound call per attempt.
//!
//! # Responsibilities
//! - Build the upstream URI (path template, original query)
//! - Copy headers, drop hop-by-hop ones, add X-Forwarded-* and injected headers
//! - Bound the call by the attempt budget
//! - Classify the outcome: success, retryable failure, or client error
//!
//! # Design Decisions
//! - The body streams through untouched unless it must be replayed
//! - Response bodies are never buffered
//! - Hop-by-hop headers stripped in both directions

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri, Version};
use bytes::Bytes;
use hyper::body::Body as _;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};
use crate::http::request::X_REQUEST_ID;
use crate::load_balancer::ServiceTarget;
use crate::resilience::{BreakerState, Deadline};

pub static X_PROXY_INSTANCE: HeaderName = HeaderName::from_static("x-proxy-instance");
pub static X_PROXY_CIRCUIT_BREAKER: HeaderName = HeaderName::from_static("x-proxy-circuit-breaker");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Fill `{name}` placeholders from the matched route's parameters.
/// Unknown placeholders are left as they are.
pub fn render_path(template: &str, params: &HashMap<String, String>) -> String {
    let mut path = template.to_string();
    for (name, value) in params {
        path = path.replace(&format!("{{{name}}}"), value);
    }
    path
}

/// Request body that can be sent more than once when it is small enough.
#[derive(Debug)]
pub enum ReplayableBody {
    /// Known to be empty.
    Empty,
    /// Buffered; every attempt gets a copy.
    Buffered(Bytes),
    /// Streamed once; later attempts get nothing.
    Streaming(Mutex<Option<Body>>),
}

impl ReplayableBody {
    /// Buffer the body only when retries are possible and its exact length
    /// is known and within `limit`.
    ///
    /// Buffering is bounded by `deadline` and aborted by `cancel`, so a
    /// stalled client cannot hold the request past either.
    pub async fn prepare(
        body: Body,
        attempts: u32,
        limit: usize,
        deadline: &Deadline,
        cancel: &CancellationToken,
    ) -> GatewayResult<Self> {
        let exact = body.size_hint().exact();
        match exact {
            Some(0) => Ok(ReplayableBody::Empty),
            Some(len) if attempts > 1 && len <= limit as u64 => {
                let read = tokio::time::timeout_at(deadline.instant(), axum::body::to_bytes(body, limit));
                let bytes = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    result = read => match result {
                        Ok(Ok(bytes)) => bytes,
                        Ok(Err(e)) => {
                            tracing::debug!(error = %e, "Failed to read request body");
                            return Err(GatewayError::RequestBody(e.to_string()));
                        }
                        Err(_) => return Err(GatewayError::UpstreamTimeout(deadline.limit())),
                    },
                };
                Ok(ReplayableBody::Buffered(bytes))
            }
            _ => Ok(ReplayableBody::Streaming(Mutex::new(Some(body)))),
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, ReplayableBody::Streaming(_))
    }

    /// Body for the next attempt.
    pub fn take(&self) -> Option<Body> {
        match self {
            ReplayableBody::Empty => Some(Body::empty()),
            ReplayableBody::Buffered(bytes) => Some(Body::from(bytes.clone())),
            ReplayableBody::Streaming(slot) => slot.lock().ok().and_then(|mut b| b.take()),
        }
    }
}

/// Inbound request data reused for every attempt.
#[derive(Debug, Clone)]
pub struct OutboundTemplate {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub client_addr: Option<SocketAddr>,
    pub path_params: HashMap<String, String>,
    pub request_id: String,
}

/// Performs upstream calls through a pooled hyper client.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: Client<HttpConnector, Body>,
}

impl Default for ProxyForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyForwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    pub fn with_client(client: Client<HttpConnector, Body>) -> Self {
        Self { client }
    }

    /// Outbound request for one attempt against `target`.
    pub fn build_request(
        &self,
        template: &OutboundTemplate,
        target: &ServiceTarget,
        path_template: Option<&str>,
        inject: &BTreeMap<String, String>,
        body: Body,
    ) -> GatewayResult<Request<Body>> {
        let path = match path_template {
            Some(t) => render_path(t, &template.path_params),
            None => template.uri.path().to_string(),
        };
        let path_and_query = match template.uri.query() {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        let uri: Uri = format!("http://{}{}", target.authority(), path_and_query)
            .parse()
            .map_err(|e| GatewayError::Upstream {
                target: target.key(),
                message: format!("invalid upstream URI: {e}"),
            })?;

        let mut headers = template.headers.clone();
        strip_hop_by_hop(&mut headers);

        let original_host = headers.remove(header::HOST);
        if let Some(host) = original_host.or_else(|| {
            template
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        }) {
            headers.insert(X_FORWARDED_HOST.clone(), host);
        }
        if let Ok(host) = HeaderValue::from_str(&target.authority()) {
            headers.insert(header::HOST, host);
        }

        if let Some(addr) = template.client_addr {
            let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            let proto = template.uri.scheme_str().unwrap_or("http");
            if let Ok(value) = HeaderValue::from_str(proto) {
                headers.insert(X_FORWARDED_PROTO.clone(), value);
            }
        }

        for (name, value) in inject {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "Skipping invalid injected header"),
            }
        }

        if let Ok(value) = HeaderValue::from_str(&template.request_id) {
            headers.insert(X_REQUEST_ID.clone(), value);
        }

        let mut request = Request::builder()
            .method(template.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| GatewayError::Upstream {
                target: target.key(),
                message: e.to_string(),
            })?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Send one request, bounded by `budget`, and classify the result.
    pub async fn send(
        &self,
        target: &ServiceTarget,
        request: Request<Body>,
        budget: Duration,
    ) -> GatewayResult<Response<Body>> {
        let response = match tokio::time::timeout(budget, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(target = %target, error = %e, "Upstream connection error");
                return Err(GatewayError::Upstream {
                    target: target.key(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                tracing::debug!(target = %target, budget_ms = budget.as_millis() as u64, "Upstream attempt timed out");
                return Err(GatewayError::UpstreamTimeout(budget));
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let status = parts.status;
        let response = Response::from_parts(parts, Body::new(body));

        if status.is_server_error() {
            Err(GatewayError::UpstreamStatus {
                target: target.key(),
                status,
                response,
            })
        } else if status.is_client_error() {
            Err(GatewayError::Client {
                target: target.key(),
                status,
                response,
            })
        } else {
            Ok(response)
        }
    }
}

/// Tag a relayed response with the chosen target and its breaker state.
pub fn annotate(response: &mut Response<Body>, target: &ServiceTarget, breaker: BreakerState) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&target.key()) {
        headers.insert(X_PROXY_INSTANCE.clone(), value);
    }
    headers.insert(
        X_PROXY_CIRCUIT_BREAKER.clone(),
        HeaderValue::from_static(breaker.as_str()),
    );
}
