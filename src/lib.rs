//! Request-forwarding gateway library.
//!
//! [`Gateway::forward`] takes an inbound request and the route's
//! [`ProxyDirective`], resolves the upstream pool, picks a target, guards it
//! with a circuit breaker, and forwards with bounded retries under an
//! overall deadline.

// Core
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod routing;

// Upstream management
pub mod discovery;
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::{GatewayConfig, ProxyDirective};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use http::{HttpServer, RequestContext};
pub use lifecycle::Shutdown;
