//! Paced batch lookups against a geolocation provider

use std::time::Duration;

use anyhow::{Result, bail};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{Value, json};

use crate::enrichment::{GeoProvider, MAX_BATCH_SIZE};
use crate::storage::STATUS_FAIL;

/// Failure marker recorded for an IP whose batch could not be resolved
pub fn failure_record(ip: &str, message: &str) -> Value {
    json!({
        "query": ip,
        "status": STATUS_FAIL,
        "message": message,
    })
}

/// Splits IPs into batches and resolves them one request at a time,
/// pausing between batches to stay within a requests-per-minute budget
pub struct BatchGeoClient {
    provider: Box<dyn GeoProvider>,
    batch_size: usize,
    pause: Duration,
}

impl BatchGeoClient {
    /// Create a client. `batch_size` must be within `1..=100` and
    /// `requests_per_minute` at least 1.
    pub fn new(
        provider: Box<dyn GeoProvider>,
        batch_size: usize,
        requests_per_minute: u32,
    ) -> Result<Self> {
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            bail!("Batch size must be between 1 and {}, got {}", MAX_BATCH_SIZE, batch_size);
        }
        if requests_per_minute == 0 {
            bail!("Requests per minute must be at least 1");
        }

        Ok(Self {
            provider,
            batch_size,
            pause: Duration::from_secs_f64(60.0 / f64::from(requests_per_minute)),
        })
    }

    /// Resolve `ips` batch by batch, yielding one group of records per batch.
    ///
    /// Batches are sent sequentially. After a batch's records have been
    /// yielded, the next batch waits a full `60 / rpm` seconds before its
    /// request goes out, however long the previous request took. Nothing
    /// waits after the last batch. A failed batch yields a failure marker
    /// for every IP in it and the stream carries on with the next batch.
    pub fn query_batches<'a>(&'a self, ips: &'a [String]) -> impl Stream<Item = Vec<Value>> + 'a {
        let total = ips.len().div_ceil(self.batch_size);
        stream::iter(ips.chunks(self.batch_size).enumerate()).then(move |(index, chunk)| async move {
            // Runs only once the consumer asks for the next batch
            if index > 0 {
                tokio::time::sleep(self.pause).await;
            }
            tracing::info!(
                provider = self.provider.name(),
                batch = index + 1,
                total,
                size = chunk.len(),
                "Querying geolocation batch"
            );
            self.query_chunk(chunk).await
        })
    }

    async fn query_chunk(&self, chunk: &[String]) -> Vec<Value> {
        match self.provider.lookup_batch(chunk.to_vec()).await {
            Ok(records) => records,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(
                    provider = self.provider.name(),
                    size = chunk.len(),
                    error = %message,
                    "Batch lookup failed, marking batch as failed"
                );
                chunk.iter().map(|ip| failure_record(ip, &message)).collect()
            }
        }
    }
}
