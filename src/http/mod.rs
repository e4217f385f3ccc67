//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → server.rs (Axum setup, request ID, route lookup; binary only)
//!     → request.rs (RequestContext: request ID, client address, cancellation)
//!     → [gateway picks target, drives retries]
//!     → forwarder.rs (outbound request per attempt, outcome classification)
//!     → response.rs (relay, or map a terminal error to a response)
//!     → Send to client
//! ```

pub mod forwarder;
pub mod request;
pub mod response;
pub mod server;

pub use forwarder::{OutboundTemplate, ProxyForwarder, ReplayableBody};
pub use request::{RequestContext, X_REQUEST_ID};
pub use response::error_response;
pub use server::HttpServer;
