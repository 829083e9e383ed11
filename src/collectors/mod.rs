//! Threat intelligence feed collectors

pub mod feodo;
pub mod latest;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub use feodo::{FeodoFeed, FeodoTrackerCollector};
pub use latest::publish_latest;

/// Trait for feed collectors
#[async_trait]
pub trait FeedCollector: Send + Sync {
    /// Feed name
    fn name(&self) -> &'static str;

    /// File name of the stable alias kept beside downloaded copies
    fn latest_alias(&self) -> String;

    /// Download the feed and store it verbatim at `destination`
    async fn fetch(&self, destination: &Path) -> Result<FetchedFile>;
}

/// A feed body written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Feed collection result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub source: String,
    pub saved: FetchedFile,
    pub latest: Option<PathBuf>,
}

/// Fetch a feed into `destination`, then point the feed's `latest` alias at
/// it. A failed download is returned as an error and leaves the alias alone;
/// a failed alias update is only logged.
pub async fn fetch_and_publish(collector: &dyn FeedCollector, destination: &Path) -> Result<FetchReport> {
    let saved = collector.fetch(destination).await?;
    tracing::info!(
        feed = collector.name(),
        path = %saved.path.display(),
        bytes = saved.bytes,
        sha256 = %saved.sha256,
        "Saved feed"
    );

    let latest = match publish_latest(&saved.path, &collector.latest_alias()).await {
        Ok(alias) => {
            tracing::info!(path = %alias.display(), "Updated latest pointer");
            Some(alias)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not update latest pointer");
            None
        }
    };

    Ok(FetchReport {
        source: collector.name().to_string(),
        saved,
        latest,
    })
}
