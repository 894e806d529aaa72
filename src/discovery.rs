//! Service discovery for sidecar targets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{ConsulSdConfig, FileTargets, StaticTargets, TargetGroup};
use crate::errors::{FleetError, FleetResult};

/// Yields the current `host:port` list for a target group.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover_targets(&self) -> FleetResult<Vec<String>>;
}

/// Builds the discoverer a target group is configured with.
pub fn new_from_config(group: &TargetGroup) -> FleetResult<Arc<dyn Discoverer>> {
    if let Some(static_targets) = &group.static_targets {
        return Ok(Arc::new(static_targets.clone()));
    }
    if let Some(file_targets) = &group.file_targets {
        return Ok(Arc::new(file_targets.clone()));
    }
    if let Some(consul) = &group.consul_sd_config {
        return Ok(Arc::new(ConsulCatalog::new(consul)?));
    }
    Err(FleetError::Config(format!(
        "target group {}: missing target discovery config",
        group.group
    )))
}

#[async_trait]
impl Discoverer for StaticTargets {
    async fn discover_targets(&self) -> FleetResult<Vec<String>> {
        Ok(self.targets.clone())
    }
}

#[async_trait]
impl Discoverer for FileTargets {
    async fn discover_targets(&self) -> FleetResult<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Consul catalog discovery backend.
pub struct ConsulCatalog {
    client: reqwest::Client,
    config: ConsulSdConfig,
}

impl ConsulCatalog {
    pub fn new(config: &ConsulSdConfig) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| FleetError::Config(format!("unable to build consul client: {err}")))?;
        Ok(ConsulCatalog {
            client,
            config: config.clone(),
        })
    }

    fn service_url(&self) -> String {
        format!(
            "{}/v1/catalog/service/{}",
            self.config.server.trim_end_matches('/'),
            self.config.service
        )
    }
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "ServicePort")]
    service_port: u16,
}

#[async_trait]
impl Discoverer for ConsulCatalog {
    async fn discover_targets(&self) -> FleetResult<Vec<String>> {
        let mut request = self.client.get(self.service_url());
        if !self.config.datacenter.is_empty() {
            request = request.query(&[("dc", self.config.datacenter.as_str())]);
        }
        if !self.config.filter.is_empty() {
            request = request.query(&[("filter", self.config.filter.as_str())]);
        }
        if !self.config.token.is_empty() {
            request = request.header("X-Consul-Token", self.config.token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| FleetError::http("consul catalog", err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::remote("consul catalog", status));
        }
        let services: Vec<ConsulService> = response
            .json()
            .await
            .map_err(|err| FleetError::http("consul catalog", err))?;
        Ok(services
            .into_iter()
            .map(|service| format!("{}:{}", service.address, service.service_port))
            .collect())
    }
}
