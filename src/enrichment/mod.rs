//! Enrichment services for blocklist datasets

pub mod batch;
pub mod ipapi;
pub mod pipeline;
pub mod ports;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use batch::BatchGeoClient;
pub use pipeline::{EnrichReport, EnrichmentPipeline};
pub use ports::{PortNameResolver, ServiceRegistry};

/// Largest batch the geolocation provider accepts in one request
pub const MAX_BATCH_SIZE: usize = 100;

/// Trait for batch geolocation providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Provider name
    fn name(&self) -> &'static str;

    /// Resolve a batch of IPs in a single request.
    ///
    /// Returns one JSON object per resolved IP, each echoing the IP in its
    /// `query` field. Any error fails the whole batch.
    async fn lookup_batch(&self, ips: Vec<String>) -> Result<Vec<Value>>;
}

/// Why a batch lookup failed
#[derive(Debug, thiserror::Error)]
pub enum GeoLookupError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed provider response: {0}")]
    Decode(#[source] reqwest::Error),
}

impl GeoLookupError {
    /// Classify an error raised while sending a request
    pub fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GeoLookupError::Timeout(err)
        } else {
            GeoLookupError::Transport(err)
        }
    }
}
