//! Per-route proxy directive.
//!
//! A `ProxyDirective` is the declarative description of how one route is
//! proxied. It is produced by the route-configuration layer, either
//! deserialized from the gateway's TOML file or parsed from an
//! annotation-style `key=value` argument list with [`ProxyDirective::from_args`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::ValidationError;

/// Load-balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
    Weighted,
}

impl FromStr for LoadBalancerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" | "least_conn" => Ok(Self::LeastConnections),
            "ip_hash" => Ok(Self::IpHash),
            "weighted" | "weighted_round_robin" => Ok(Self::Weighted),
            other => Err(ValidationError::UnknownLoadBalancer(other.to_string())),
        }
    }
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    None,
    Linear,
    #[default]
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(ValidationError::UnknownBackoff(other.to_string())),
        }
    }
}

/// Granularity of circuit breakers for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker per target (host:port).
    #[default]
    PerTarget,
    /// One breaker shared by the whole pool.
    PerService,
}

/// Active health check settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Path to probe with GET. Health checking is off when unset.
    pub path: Option<String>,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Consecutive successful probes before a target is marked healthy.
    pub healthy_threshold: u32,

    /// Consecutive failed probes before a target is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,

    /// How long the breaker stays open before a trial is allowed.
    pub recovery_timeout_ms: u64,

    /// Multiplier applied to the recovery timeout each time a trial fails.
    /// `1.0` keeps it constant.
    pub recovery_backoff_multiplier: f64,

    /// Upper bound for the grown recovery timeout.
    pub max_recovery_timeout_ms: u64,

    pub scope: BreakerScope,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            recovery_backoff_multiplier: 1.0,
            max_recovery_timeout_ms: 300_000,
            scope: BreakerScope::PerTarget,
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one. `1` disables retries.
    pub attempts: u32,

    pub backoff: BackoffKind,

    /// Base delay in milliseconds.
    pub base_delay_ms: u64,

    /// Optional cap for computed delays in milliseconds.
    pub max_delay_ms: Option<u64>,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: None,
            jitter: false,
        }
    }
}

/// Declarative configuration describing how one route is proxied.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyDirective {
    /// Single upstream (`host:port` or `http://host:port`).
    pub target: Option<String>,

    /// Static upstream list. Entries may carry `;weight=N`.
    pub targets: Vec<String>,

    /// Logical service name resolved through `discovery`.
    pub service: Option<String>,

    /// Discovery backend name (`static`, `dns`, `consul`, `kubernetes`).
    pub discovery: Option<String>,

    /// Consul agent address (default `localhost:8500`).
    pub consul_address: Option<String>,

    /// Kubernetes namespace (default `default`).
    pub k8s_namespace: Option<String>,

    /// Kubernetes API server base URL (default in-cluster address).
    pub k8s_api_server: Option<String>,

    /// Port used for DNS A/AAAA answers.
    pub dns_port: u16,

    pub load_balancer: LoadBalancerKind,
    pub health_check: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,

    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,

    /// Overall deadline for all attempts and backoff, in milliseconds.
    pub deadline_ms: u64,

    /// Discovery refresh cadence in milliseconds.
    pub refresh_interval_ms: u64,

    /// Upstream path template. `{name}` segments are filled from the
    /// request's path parameters. The inbound path is used when unset.
    pub path: Option<String>,

    /// Headers added to (or overriding) the outbound request.
    pub headers: BTreeMap<String, String>,

    /// Largest request body buffered so that it can be replayed on retry.
    pub max_replay_body_bytes: usize,
}

impl Default for ProxyDirective {
    fn default() -> Self {
        Self {
            target: None,
            targets: Vec::new(),
            service: None,
            discovery: None,
            consul_address: None,
            k8s_namespace: None,
            k8s_api_server: None,
            dns_port: 80,
            load_balancer: LoadBalancerKind::RoundRobin,
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout_ms: 10_000,
            deadline_ms: 30_000,
            refresh_interval_ms: 30_000,
            path: None,
            headers: BTreeMap::new(),
            max_replay_body_bytes: 1024 * 1024,
        }
    }
}

impl ProxyDirective {
    /// Directive for a fixed list of upstreams.
    pub fn static_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Directive for a service resolved through a discovery backend.
    pub fn discovered(service: impl Into<String>, discovery: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            discovery: Some(discovery.into()),
            ..Self::default()
        }
    }

    /// Parse an annotation-style argument list, e.g.
    /// `["target=http://user-service:8081", "retries=3", "timeout=15s"]`.
    ///
    /// Unknown keys and entries without `=` are skipped. Malformed values for
    /// known keys are errors.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ValidationError> {
        let mut directive = Self::default();

        for arg in args {
            let Some((key, value)) = arg.as_ref().split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "target" => directive.target = Some(value.to_string()),
                "targets" => {
                    directive.targets = value
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "service" => directive.service = Some(value.to_string()),
                "discovery" => directive.discovery = Some(value.to_string()),
                "consul_address" => directive.consul_address = Some(value.to_string()),
                "k8s_namespace" => directive.k8s_namespace = Some(value.to_string()),
                "k8s_api_server" => directive.k8s_api_server = Some(value.to_string()),
                "dns_port" => directive.dns_port = parse_number(key, value)?,
                "load_balancer" => directive.load_balancer = value.parse()?,
                "health_check" => directive.health_check.path = Some(value.to_string()),
                "health_interval" => directive.health_check.interval_ms = parse_millis(key, value)?,
                "health_timeout" => directive.health_check.timeout_ms = parse_millis(key, value)?,
                "health_threshold" => {
                    let n = parse_number(key, value)?;
                    directive.health_check.healthy_threshold = n;
                    directive.health_check.unhealthy_threshold = n;
                }
                "timeout" => directive.timeout_ms = parse_millis(key, value)?,
                "deadline" => directive.deadline_ms = parse_millis(key, value)?,
                "refresh_interval" => directive.refresh_interval_ms = parse_millis(key, value)?,
                // `retries` counts retries, `attempts` counts calls.
                "retries" => {
                    let retries: u32 = parse_number(key, value)?;
                    directive.retry.attempts = retries.saturating_add(1);
                }
                "attempts" => directive.retry.attempts = parse_number(key, value)?,
                "retry_backoff" => directive.retry.backoff = value.parse()?,
                "retry_delay" => directive.retry.base_delay_ms = parse_millis(key, value)?,
                "retry_max_delay" => directive.retry.max_delay_ms = Some(parse_millis(key, value)?),
                "retry_jitter" => directive.retry.jitter = parse_number(key, value)?,
                "circuit_breaker" => {
                    directive.circuit_breaker.recovery_timeout_ms = parse_millis(key, value)?;
                }
                "failure_threshold" => {
                    directive.circuit_breaker.failure_threshold = parse_number(key, value)?;
                }
                "breaker_scope" => {
                    directive.circuit_breaker.scope = match value {
                        "per_target" | "target" => BreakerScope::PerTarget,
                        "per_service" | "service" => BreakerScope::PerService,
                        other => {
                            return Err(ValidationError::InvalidValue {
                                field: key.to_string(),
                                value: other.to_string(),
                            })
                        }
                    };
                }
                "path" => directive.path = Some(value.to_string()),
                "headers" => {
                    for pair in value.split(',') {
                        if let Some((name, val)) = pair.split_once('=') {
                            directive
                                .headers
                                .insert(name.trim().to_string(), val.trim().to_string());
                        }
                    }
                }
                other => tracing::debug!(key = %other, "Ignoring unknown proxy directive argument"),
            }
        }

        Ok(directive)
    }

    /// Identity of the upstream pool this directive resolves to. Directives
    /// that share it share a pool, health loop, and breakers.
    pub fn service_key(&self) -> String {
        match &self.service {
            Some(service) if self.discovery_backend() != "static" => {
                format!("{}:{}", self.discovery_backend(), service)
            }
            _ => format!("static:{}", self.static_target_specs().join(",")),
        }
    }

    /// Human-readable service name for logs and errors.
    pub fn service_name(&self) -> String {
        match &self.service {
            Some(service) => service.clone(),
            None => self.static_target_specs().join(","),
        }
    }

    /// Discovery backend name, `static` when only targets are configured.
    pub fn discovery_backend(&self) -> &str {
        match (&self.discovery, &self.service) {
            (Some(name), _) => name.as_str(),
            _ => "static",
        }
    }

    /// `target` followed by `targets`.
    pub fn static_target_specs(&self) -> Vec<String> {
        self.target
            .iter()
            .chain(self.targets.iter())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

fn parse_number<T: FromStr>(field: &str, value: &str) -> Result<T, ValidationError> {
    value.parse().map_err(|_| ValidationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_millis(field: &str, value: &str) -> Result<u64, ValidationError> {
    let duration = parse_duration(value).ok_or_else(|| ValidationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })?;
    Ok(duration.as_millis() as u64)
}

/// Parse a Go-style duration string: `250ms`, `10s`, `1m30s`, `1.5h`.
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += value * nanos_per_unit;
    }

    Some(Duration::from_nanos(total as u64))
}
