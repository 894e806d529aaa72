use std::time::Duration;

use crate::config::TargetGroup;
use crate::errors::{FleetError, FleetResult};
use crate::fetch::SidecarClient;
use crate::types::SnapshotInfo;

/// Probes the sidecars of one target group over a shared, pooled HTTP
/// client carrying the group's TLS material and auth headers.
pub struct Prober {
    group: String,
    scheme: String,
    api_path: String,
    client: reqwest::Client,
}

impl Prober {
    pub fn new(group: &TargetGroup) -> FleetResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(3)
            .redirect(reqwest::redirect::Policy::limited(1))
            .default_headers(group.auth_headers()?);
        if let Some(tls) = &group.tls_config {
            builder = tls.apply(builder)?;
        }
        let client = builder
            .build()
            .map_err(|err| FleetError::Config(format!("unable to build probe client: {err}")))?;
        Ok(Prober {
            group: group.group.clone(),
            scheme: group.scheme.clone(),
            api_path: group.api_path.clone(),
            client,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Composes the base URL of one target's sidecar API.
    pub fn target_url(&self, host_port: &str) -> String {
        format!("{}://{}{}", self.scheme, host_port, self.api_path)
    }

    /// Fetches the snapshot inventory of a single target.
    pub async fn probe(&self, host_port: &str) -> FleetResult<Vec<SnapshotInfo>> {
        SidecarClient::with_client(self.client.clone(), self.target_url(host_port))
            .list_snapshots()
            .await
    }
}
