//! ip-api.com batch geolocation provider

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::enrichment::{GeoLookupError, GeoProvider};

/// Batch endpoint, up to 100 queries per request on the free tier
pub const IP_API_BATCH_URL: &str = "http://ip-api.com/batch";

#[derive(Debug, Serialize)]
struct BatchQuery<'a> {
    query: &'a str,
}

/// ip-api.com batch provider
pub struct IpApiProvider {
    client: Client,
    endpoint: String,
}

impl IpApiProvider {
    /// Create a provider posting to `endpoint` with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn post_batch(&self, ips: &[String]) -> Result<Vec<Value>, GeoLookupError> {
        let payload: Vec<BatchQuery<'_>> = ips.iter().map(|ip| BatchQuery { query: ip }).collect();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(GeoLookupError::from_send)?;

        if !response.status().is_success() {
            return Err(GeoLookupError::Status(response.status()));
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                GeoLookupError::Timeout(e)
            } else {
                GeoLookupError::Decode(e)
            }
        })
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &'static str {
        "ip-api"
    }

    async fn lookup_batch(&self, ips: Vec<String>) -> Result<Vec<Value>> {
        let records = self.post_batch(&ips).await?;
        tracing::debug!(
            provider = self.name(),
            requested = ips.len(),
            returned = records.len(),
            "Batch lookup complete"
        );
        Ok(records)
    }
}
