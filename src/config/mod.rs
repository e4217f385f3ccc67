//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)                    annotation args (key=value)
//!     → loader.rs (parse & deserialize)     → ProxyDirective::from_args
//!     → validation.rs (semantic checks)     → validation.rs
//!     → GatewayConfig (validated, immutable)
//!     → each route's ProxyDirective is registered with the Gateway
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod directive;
pub mod loader;
pub mod schema;
pub mod validation;

pub use directive::{
    BackoffKind, BreakerScope, CircuitBreakerConfig, HealthCheckConfig, LoadBalancerKind,
    ProxyDirective, RetryConfig,
};
pub use schema::{GatewayConfig, ListenerConfig, LogFormat, ObservabilityConfig, RouteConfig};
