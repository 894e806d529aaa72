//! Typed client for the tracker API.

use reqwest::header::ACCEPT;
use reqwest::StatusCode;

use crate::errors::{FleetError, FleetResult};
use crate::types::SnapshotSource;

/// Client for the central snapshot tracker.
#[derive(Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
    base_url: String,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        TrackerClient::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        TrackerClient {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the freshest snapshots fleet-wide, newest first. A negative
    /// `max` asks for the server-side maximum.
    pub async fn get_best_snapshots(&self, max: i64) -> FleetResult<Vec<SnapshotSource>> {
        let url = format!("{}/v1/best_snapshots", self.base_url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .query(&[("max", max.to_string())])
            .send()
            .await
            .map_err(|err| FleetError::http("get best snapshots", err))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FleetError::remote("get best snapshots", status));
        }
        response
            .json()
            .await
            .map_err(|err| FleetError::Protocol(format!("get best snapshots: {err}")))
    }

    /// Returns all snapshot chains anchored at the given full-snapshot slot.
    pub async fn get_snapshot_at_slot(&self, slot: u64) -> FleetResult<Vec<SnapshotSource>> {
        let url = format!("{}/v1/snapshots", self.base_url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .query(&[("slot", slot.to_string())])
            .send()
            .await
            .map_err(|err| FleetError::http("get snapshots at slot", err))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FleetError::remote("get snapshots at slot", status));
        }
        response
            .json()
            .await
            .map_err(|err| FleetError::Protocol(format!("get snapshots at slot {slot}: {err}")))
    }
}
