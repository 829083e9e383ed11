//! FeodoForge
//!
//! Command line entry point: `fetch` downloads a blocklist, `enrich` augments it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use feodoforge::collectors::{FeodoFeed, FeodoTrackerCollector, fetch_and_publish};
use feodoforge::enrichment::ipapi::{IP_API_BATCH_URL, IpApiProvider};
use feodoforge::enrichment::{BatchGeoClient, EnrichmentPipeline};

/// FeodoForge
#[derive(Parser, Debug)]
#[command(name = "feodoforge")]
#[command(about = "Fetch and enrich Feodo Tracker C2 blocklists")]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the latest blocklist CSV and update the latest pointer
    Fetch(FetchArgs),
    /// Enrich a blocklist CSV with port names, lifespans and geolocation
    Enrich(EnrichArgs),
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
    /// Output CSV path. Defaults to <data-dir>/<feed>_YYYYMMDD.csv
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Blocklist variant
    #[arg(long, env = "FEODO_FEED", value_enum, default_value_t = FeodoFeed::Aggressive)]
    feed: FeodoFeed,

    /// Download from this URL instead of abuse.ch
    #[arg(long, env = "FEODO_FEED_URL")]
    url: Option<Url>,

    /// Directory for dated downloads
    #[arg(long, env = "FEODO_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
}

#[derive(clap::Args, Debug)]
struct EnrichArgs {
    /// Input CSV (e.g. data/latest_feodo_aggressive.csv)
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the enriched CSV
    #[arg(short, long)]
    output: PathBuf,

    /// IP enrichment cache
    #[arg(long, env = "GEO_CACHE_PATH", default_value = "data/ip_geo_cache.json")]
    cache: PathBuf,

    /// Requests per minute for the geolocation batch endpoint
    #[arg(long, alias = "rps", env = "GEO_RPM", default_value_t = 40,
          value_parser = clap::value_parser!(u32).range(1..))]
    rpm: u32,

    /// IPs per geolocation request
    #[arg(long, env = "GEO_BATCH_SIZE", default_value_t = 100,
          value_parser = clap::value_parser!(u16).range(1..=100))]
    batch: u16,

    /// HTTP timeout in seconds
    #[arg(long, env = "GEO_TIMEOUT_SECS", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Geolocation batch endpoint
    #[arg(long, env = "GEO_API_URL", default_value = IP_API_BATCH_URL)]
    geo_url: Url,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_json);

    let result = match args.command {
        Command::Fetch(fetch) => run_fetch(fetch).await,
        Command::Enrich(enrich) => run_enrich(enrich).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "feodoforge=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let mut collector = FeodoTrackerCollector::new(args.feed)?;
    if let Some(url) = args.url {
        collector = collector.with_url(url);
    }

    let destination = args
        .output
        .unwrap_or_else(|| args.feed.dated_path(&args.data_dir, Utc::now()));

    tracing::info!(feed = %args.feed, url = collector.url(), "Downloading latest dataset");

    let report = fetch_and_publish(&collector, &destination)
        .await
        .context("Download failed")?;

    tracing::info!(
        source = %report.source,
        saved = %report.saved.path.display(),
        bytes = report.saved.bytes,
        latest = ?report.latest,
        "Fetch complete"
    );

    Ok(())
}

async fn run_enrich(args: EnrichArgs) -> Result<()> {
    let provider = IpApiProvider::new(args.geo_url, Duration::from_secs(args.timeout))?;
    let client = BatchGeoClient::new(Box::new(provider), usize::from(args.batch), args.rpm)?;
    let pipeline = EnrichmentPipeline::new(client).with_cache_path(&args.cache);

    let report = pipeline
        .enrich_file(&args.input, &args.output)
        .await
        .context("Enrichment failed")?;

    tracing::info!(
        output = %args.output.display(),
        rows = report.rows,
        unique_ips = report.unique_ips,
        cache_hits = report.cache_hits,
        queried = report.queried_ips,
        failed = report.failed_lookups,
        "Enriched CSV saved"
    );

    Ok(())
}
