//! Kubernetes discovery through the Endpoints API.
//!
//! Reads `/api/v1/namespaces/<ns>/endpoints/<service>`. Ready addresses
//! become targets; not-ready addresses are kept but start Unhealthy, so the
//! health checker can bring them back. Inside a cluster the API server,
//! bearer token, and CA come from the service-account mount.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ProxyDirective;
use crate::discovery::{required_service, DiscoveryError, DiscoveryResult, Resolver};
use crate::load_balancer::{HealthState, ServiceTarget};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_API_SERVER: &str = "https://kubernetes.default.svc";
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

/// Prefer a port named `http`, then the first one.
fn pick_port(ports: &[EndpointPort]) -> Option<u16> {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some("http"))
        .or_else(|| ports.first())
        .map(|p| p.port)
}

fn to_target(address: EndpointAddress, port: u16, state: HealthState) -> ServiceTarget {
    let mut metadata = HashMap::new();
    if let Some(hostname) = address.hostname {
        metadata.insert("hostname".to_string(), hostname);
    }
    if let Some(node) = address.node_name {
        metadata.insert("node".to_string(), node);
    }
    ServiceTarget::new(address.ip, port)
        .with_metadata(metadata)
        .with_health(state)
}

/// Normalize an Endpoints object into targets.
pub fn endpoints_to_targets(endpoints: Endpoints) -> Vec<ServiceTarget> {
    let mut targets = Vec::new();
    for subset in endpoints.subsets {
        let Some(port) = pick_port(&subset.ports) else {
            continue;
        };
        for address in subset.addresses {
            targets.push(to_target(address, port, HealthState::Unknown));
        }
        for address in subset.not_ready_addresses {
            targets.push(to_target(address, port, HealthState::Unhealthy));
        }
    }
    targets
}

#[derive(Debug)]
pub struct KubernetesResolver {
    service: String,
    url: String,
    token_path: Option<String>,
    refresh: Duration,
    client: reqwest::Client,
}

impl KubernetesResolver {
    pub fn from_directive(directive: &ProxyDirective) -> DiscoveryResult<Self> {
        let service = required_service(directive)?;
        let namespace = directive.k8s_namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let api_server = directive
            .k8s_api_server
            .clone()
            .or_else(in_cluster_api_server)
            .unwrap_or_else(|| DEFAULT_API_SERVER.to_string());

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        let ca_path = Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt");
        if let Ok(pem) = std::fs::read(&ca_path) {
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| catalog_error(&service, format!("invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| catalog_error(&service, e.to_string()))?;

        let token_path = Path::new(SERVICE_ACCOUNT_DIR).join("token");
        Ok(Self {
            url: format!(
                "{}/api/v1/namespaces/{}/endpoints/{}",
                api_server.trim_end_matches('/'),
                namespace,
                service
            ),
            token_path: token_path
                .exists()
                .then(|| token_path.to_string_lossy().into_owned()),
            service,
            refresh: directive.refresh_interval(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn in_cluster_api_server() -> Option<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    if host.contains(':') {
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}

fn catalog_error(service: &str, message: String) -> DiscoveryError {
    DiscoveryError::Catalog {
        backend: "kubernetes",
        service: service.to_string(),
        message,
    }
}

#[async_trait]
impl Resolver for KubernetesResolver {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>> {
        let mut request = self.client.get(&self.url);
        // Tokens rotate, so read on every call.
        if let Some(path) = &self.token_path {
            let token = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| catalog_error(&self.service, format!("reading token: {e}")))?;
            request = request.bearer_auth(token.trim());
        }

        let response = request
            .send()
            .await
            .map_err(|e| catalog_error(&self.service, e.to_string()))?;
        if !response.status().is_success() {
            return Err(catalog_error(
                &self.service,
                format!("unexpected status {}", response.status()),
            ));
        }

        let endpoints: Endpoints = response
            .json()
            .await
            .map_err(|e| catalog_error(&self.service, e.to_string()))?;
        Ok(endpoints_to_targets(endpoints))
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh)
    }
}
