//! HTTP relay client
//!
//! Thin reqwest client for the relay's store-and-forward contract. Every call
//! is bounded by the configured per-request timeout; a timeout or transport
//! error surfaces as a network error and marks the device offline for the
//! cycle.

use crate::relay::{DeviceInfo, PushReport, Relay, RelayHealth, RelayMetrics, SyncPage};
use async_trait::async_trait;
use engram_core::{DeviceId, EngramError, HlcTimestamp, Result};
use engram_journal::OpLogEvent;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct PushBody<'a> {
    events: &'a [OpLogEvent],
    device_id: &'a str,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    device_id: &'a str,
    device_info: &'a DeviceInfo,
}

/// Relay reachable over HTTP
pub struct HttpRelay {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelay {
    /// Build a client for a relay base URL with a per-call timeout
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngramError::network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport_err(e: reqwest::Error) -> EngramError {
    if e.is_timeout() {
        EngramError::network(format!("relay request timed out: {e}"))
    } else {
        EngramError::network(format!("relay request failed: {e}"))
    }
}

fn status_err(path: &str, status: reqwest::StatusCode) -> EngramError {
    EngramError::network(format!("relay returned {status} for {path}"))
}

#[async_trait]
impl Relay for HttpRelay {
    async fn health(&self) -> Result<RelayHealth> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err("/health", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| EngramError::malformed(format!("bad health response: {e}")))
    }

    async fn events_since(
        &self,
        after: Option<&HlcTimestamp>,
        device: &DeviceId,
        limit: usize,
    ) -> Result<SyncPage> {
        let after = after.map(|ts| ts.stringify()).unwrap_or_default();
        let limit = limit.to_string();
        let response = self
            .client
            .get(self.url("/sync/since"))
            .query(&[
                ("after", after.as_str()),
                ("device", device.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err("/sync/since", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| EngramError::malformed(format!("bad sync page: {e}")))
    }

    async fn push_events(&self, device: &DeviceId, events: &[OpLogEvent]) -> Result<PushReport> {
        let response = self
            .client
            .post(self.url("/sync/push"))
            .json(&PushBody {
                events,
                device_id: device.as_str(),
            })
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err("/sync/push", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| EngramError::malformed(format!("bad push report: {e}")))
    }

    async fn register_device(&self, device: &DeviceId, info: &DeviceInfo) -> Result<()> {
        let response = self
            .client
            .post(self.url("/devices/register"))
            .json(&RegisterBody {
                device_id: device.as_str(),
                device_info: info,
            })
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err("/devices/register", response.status()));
        }
        Ok(())
    }

    async fn metrics(&self) -> Result<RelayMetrics> {
        let response = self
            .client
            .get(self.url("/metrics"))
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err("/metrics", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| EngramError::malformed(format!("bad metrics response: {e}")))
    }
}

impl std::fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelay")
            .field("base_url", &self.base_url)
            .finish()
    }
}
