//! Fixed target list.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::ProxyDirective;
use crate::discovery::{DiscoveryError, DiscoveryResult, Resolver};
use crate::load_balancer::ServiceTarget;

/// Parse one static target: `host:port`, `http://host:port`, or bare `host`
/// (port 80), optionally followed by `;weight=N`.
pub fn parse_target(spec: &str) -> DiscoveryResult<ServiceTarget> {
    let invalid = |reason: &str| DiscoveryError::InvalidTarget {
        target: spec.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = spec.trim().split(';');
    let address = parts.next().unwrap_or_default().trim();
    let mut weight = 1;
    for param in parts {
        match param.trim().split_once('=') {
            Some(("weight", value)) => {
                weight = value.trim().parse().map_err(|_| invalid("weight must be an integer >= 0"))?;
            }
            _ => return Err(invalid("unknown target parameter")),
        }
    }

    let (host, port) = if address.contains("://") {
        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http upstreams are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        (host, url.port_or_known_default().unwrap_or(80))
    } else if let Ok(addr) = address.parse::<SocketAddr>() {
        (addr.ip().to_string(), addr.port())
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                (host.to_string(), port)
            }
            None => (address.to_string(), 80),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(ServiceTarget::new(host, port).with_weight(weight))
}

/// Returns the configured list verbatim.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    specs: Vec<String>,
}

impl StaticResolver {
    pub fn new(specs: Vec<String>) -> Self {
        Self { specs }
    }

    pub fn from_directive(directive: &ProxyDirective) -> DiscoveryResult<Self> {
        let specs = directive.static_target_specs();
        // Fail at registration, not per call.
        for spec in &specs {
            parse_target(spec)?;
        }
        Ok(Self::new(specs))
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>> {
        self.specs.iter().map(|s| parse_target(s)).collect()
    }

    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}
