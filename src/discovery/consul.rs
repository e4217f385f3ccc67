//! Consul catalog discovery.
//!
//! Queries `/v1/health/service/<name>?passing=true` so only instances with
//! all checks passing become targets. The service address wins over the
//! node address; `Weights.Passing` becomes the target weight and service
//! `Meta` its metadata.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ProxyDirective;
use crate::discovery::{required_service, DiscoveryError, DiscoveryResult, Resolver};
use crate::load_balancer::ServiceTarget;

const DEFAULT_ADDRESS: &str = "localhost:8500";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthEntry {
    pub node: Node,
    pub service: ServiceInstance,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInstance {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub weights: Option<Weights>,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Weights {
    pub passing: u32,
}

/// Normalize health entries into targets.
pub fn entries_to_targets(entries: Vec<HealthEntry>) -> Vec<ServiceTarget> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let host = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            if host.is_empty() {
                tracing::debug!(id = %entry.service.id, "Skipping Consul instance without address");
                return None;
            }
            let weight = entry.service.weights.map_or(1, |w| w.passing);
            let mut metadata = entry.service.meta.unwrap_or_default();
            if !entry.service.id.is_empty() {
                metadata.insert("consul_id".to_string(), entry.service.id);
            }
            Some(
                ServiceTarget::new(host, entry.service.port)
                    .with_weight(weight)
                    .with_metadata(metadata),
            )
        })
        .collect()
}

#[derive(Debug)]
pub struct ConsulResolver {
    service: String,
    url: String,
    refresh: Duration,
    client: reqwest::Client,
}

impl ConsulResolver {
    pub fn from_directive(directive: &ProxyDirective) -> DiscoveryResult<Self> {
        let service = required_service(directive)?;
        let address = directive.consul_address.as_deref().unwrap_or(DEFAULT_ADDRESS);
        let base = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| catalog_error(&service, e.to_string()))?;

        Ok(Self {
            url: format!("{}/v1/health/service/{}?passing=true", base, service),
            service,
            refresh: directive.refresh_interval(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn catalog_error(service: &str, message: String) -> DiscoveryError {
    DiscoveryError::Catalog {
        backend: "consul",
        service: service.to_string(),
        message,
    }
}

#[async_trait]
impl Resolver for ConsulResolver {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| catalog_error(&self.service, e.to_string()))?;

        if !response.status().is_success() {
            return Err(catalog_error(
                &self.service,
                format!("unexpected status {}", response.status()),
            ));
        }

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| catalog_error(&self.service, e.to_string()))?;
        Ok(entries_to_targets(entries))
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh)
    }
}
