//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds > 0)
//! - Check that every route names a usable upstream
//! - Reject header names and values that cannot go on the wire
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the parsed config
//! - Runs before a directive is registered with the gateway

use std::collections::HashSet;

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::config::directive::{LoadBalancerKind, ProxyDirective};
use crate::config::schema::GatewayConfig;
use crate::discovery::static_list::parse_target;

/// A single semantic problem with a directive or config file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("route '{route}': {error}")]
    InRoute {
        route: String,
        error: Box<ValidationError>,
    },

    #[error("duplicate route name '{0}'")]
    DuplicateRoute(String),

    #[error("no upstream configured: set target, targets, or service")]
    MissingUpstream,

    #[error("service '{0}' requires a discovery backend")]
    ServiceWithoutDiscovery(String),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("weighted load balancing needs at least one target with weight > 0")]
    AllZeroWeights,

    #[error("unknown load balancer '{0}'")]
    UnknownLoadBalancer(String),

    #[error("unknown backoff strategy '{0}'")]
    UnknownBackoff(String),

    #[error("invalid value '{value}' for '{field}'")]
    InvalidValue { field: String, value: String },

    #[error("'{0}' must be greater than zero")]
    MustBePositive(&'static str),

    #[error("retry max delay ({max_ms}ms) is below the base delay ({base_ms}ms)")]
    MaxDelayBelowBase { base_ms: u64, max_ms: u64 },

    #[error("recovery backoff multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("health check path must start with '/': {0}")]
    InvalidHealthPath(String),
}

/// Validate a single proxy directive.
pub fn validate_directive(directive: &ProxyDirective) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let specs = directive.static_target_specs();

    match (&directive.service, directive.discovery.as_deref()) {
        (Some(service), None) if specs.is_empty() => {
            errors.push(ValidationError::ServiceWithoutDiscovery(service.clone()));
        }
        (None, _) | (Some(_), Some("static")) if specs.is_empty() => {
            errors.push(ValidationError::MissingUpstream);
        }
        _ => {}
    }

    if directive.discovery_backend() == "static" {
        let mut total_weight = 0u64;
        for spec in &specs {
            match parse_target(spec) {
                Ok(target) => total_weight += u64::from(target.weight()),
                Err(e) => errors.push(ValidationError::InvalidTarget {
                    target: spec.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        if directive.load_balancer == LoadBalancerKind::Weighted
            && !specs.is_empty()
            && total_weight == 0
        {
            errors.push(ValidationError::AllZeroWeights);
        }
    }

    if directive.retry.attempts == 0 {
        errors.push(ValidationError::MustBePositive("retry.attempts"));
    }
    if let Some(max_ms) = directive.retry.max_delay_ms {
        if max_ms < directive.retry.base_delay_ms {
            errors.push(ValidationError::MaxDelayBelowBase {
                base_ms: directive.retry.base_delay_ms,
                max_ms,
            });
        }
    }

    if directive.timeout_ms == 0 {
        errors.push(ValidationError::MustBePositive("timeout_ms"));
    }
    if directive.deadline_ms == 0 {
        errors.push(ValidationError::MustBePositive("deadline_ms"));
    }
    if directive.refresh_interval_ms == 0 {
        errors.push(ValidationError::MustBePositive("refresh_interval_ms"));
    }

    let breaker = &directive.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::MustBePositive("circuit_breaker.failure_threshold"));
    }
    if breaker.recovery_timeout_ms == 0 {
        errors.push(ValidationError::MustBePositive("circuit_breaker.recovery_timeout_ms"));
    }
    if !(breaker.recovery_backoff_multiplier >= 1.0) {
        errors.push(ValidationError::InvalidMultiplier(breaker.recovery_backoff_multiplier));
    }

    let health = &directive.health_check;
    if let Some(path) = &health.path {
        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidHealthPath(path.clone()));
        }
        if health.interval_ms == 0 {
            errors.push(ValidationError::MustBePositive("health_check.interval_ms"));
        }
        if health.timeout_ms == 0 {
            errors.push(ValidationError::MustBePositive("health_check.timeout_ms"));
        }
        if health.healthy_threshold == 0 {
            errors.push(ValidationError::MustBePositive("health_check.healthy_threshold"));
        }
        if health.unhealthy_threshold == 0 {
            errors.push(ValidationError::MustBePositive("health_check.unhealthy_threshold"));
        }
    }

    for (name, value) in &directive.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err()
            || HeaderValue::from_str(value).is_err()
        {
            errors.push(ValidationError::InvalidHeader(name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the whole gateway configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut names = HashSet::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidValue {
            field: "listener.bind_address".to_string(),
            value: config.listener.bind_address.clone(),
        });
    }

    for route in &config.routes {
        if !route.name.is_empty() && !names.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::InRoute {
                route: route.name.clone(),
                error: Box::new(ValidationError::InvalidValue {
                    field: "path_prefix".to_string(),
                    value: route.path_prefix.clone(),
                }),
            });
        }
        if let Err(route_errors) = validate_directive(&route.proxy) {
            errors.extend(route_errors.into_iter().map(|error| ValidationError::InRoute {
                route: route.name.clone(),
                error: Box::new(error),
            }));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteConfig;

    #[test]
    fn test_valid_static_directive() {
        let directive = ProxyDirective::static_targets(["127.0.0.1:3000", "http://10.0.0.2:8080"]);
        assert!(validate_directive(&directive).is_ok());
    }

    #[test]
    fn test_missing_upstream() {
        let errors = validate_directive(&ProxyDirective::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingUpstream]);
    }

    #[test]
    fn test_service_without_discovery() {
        let directive = ProxyDirective {
            service: Some("users".to_string()),
            ..ProxyDirective::default()
        };
        let errors = validate_directive(&directive).unwrap_err();
        assert!(errors.contains(&ValidationError::ServiceWithoutDiscovery("users".to_string())));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut directive = ProxyDirective::static_targets(["https://secure:443"]);
        directive.retry.attempts = 0;
        directive.timeout_ms = 0;
        directive.circuit_breaker.recovery_backoff_multiplier = 0.5;

        let errors = validate_directive(&directive).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[0], ValidationError::InvalidTarget { .. }));
    }

    #[test]
    fn test_weighted_all_zero() {
        let mut directive = ProxyDirective::static_targets(["a:80;weight=0", "b:80;weight=0"]);
        directive.load_balancer = LoadBalancerKind::Weighted;
        let errors = validate_directive(&directive).unwrap_err();
        assert_eq!(errors, vec![ValidationError::AllZeroWeights]);
    }

    #[test]
    fn test_config_prefixes_route_name() {
        let config = GatewayConfig {
            routes: vec![RouteConfig {
                name: "users".to_string(),
                path_prefix: "/users".to_string(),
                host: None,
                proxy: ProxyDirective::default(),
            }],
            ..GatewayConfig::default()
        };

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors[0].to_string(),
            "route 'users': no upstream configured: set target, targets, or service"
        );
    }
}
