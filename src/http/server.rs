//! HTTP server setup for the gateway binary.
//!
//! # Responsibilities
//! - Create the Axum Router with the catch-all proxy handler
//! - Wire up middleware (tracing, request ID)
//! - Register every configured route with the gateway
//! - Dispatch requests through the route table to `Gateway::handle`
//! - Stop accepting and drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;
use crate::http::request::RequestContext;
use crate::routing::RouteTable;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub routes: Arc<RouteTable>,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    gateway: Arc<Gateway>,
}

impl HttpServer {
    /// Register every route and build the router. Invalid directives fail
    /// here, before anything is served.
    pub async fn new(config: &GatewayConfig, gateway: Arc<Gateway>) -> GatewayResult<Self> {
        let routes = RouteTable::new(&config.routes);
        for route in routes.routes() {
            gateway.register(&route.directive).await.map_err(|e| match e {
                GatewayError::Configuration(message) => {
                    GatewayError::Configuration(format!("route '{}': {message}", route.name))
                }
                other => other,
            })?;
            tracing::info!(
                route = %route.name,
                path_prefix = %route.path_prefix(),
                service = %route.directive.service_name(),
                "Route registered"
            );
        }

        let state = AppState {
            gateway: gateway.clone(),
            routes: Arc::new(routes),
        };
        Ok(Self {
            router: Self::build_router(state),
            gateway,
        })
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Run the server, accepting connections on the given listener until
    /// the gateway's shutdown fires.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let shutdown = self.gateway.shutdown_handle().clone();
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Looks up the route and hands the request to the gateway.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let (parts, body) = request.into_parts();
    let Some(matched) = state.routes.match_request(&parts) else {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        tracing::debug!(request_id = %request_id, path = %parts.uri.path(), "No route matched");
        let body = json!({
            "error": "no_route",
            "message": format!("no route matches {}", parts.uri.path()),
            "request_id": request_id,
        });
        let mut response = (StatusCode::NOT_FOUND, body.to_string()).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        return response;
    };

    let directive = matched.route.directive.clone();
    let mut ctx = RequestContext::from_request(Request::from_parts(parts, body))
        .with_path_params(matched.params);
    if let Some(addr) = client_addr {
        ctx = ctx.with_client_addr(addr);
    }

    // Cancels in-flight work if the connection drops mid-request.
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();
    state.gateway.handle(ctx, &directive).await
}
