//! Dataset enrichment pipeline
//!
//! Stages run in a fixed order, each taking the dataset by value and handing
//! back the next version. No stage drops a record.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;

use crate::enrichment::{BatchGeoClient, PortNameResolver};
use crate::models::field_utils::{
    coerce_int, normalize_column_name, parse_utc_timestamp, whole_days_between,
};
use crate::models::{Cell, Dataset};
use crate::storage::{GeoCache, ensure_parent_dir, is_failure};

pub const FIRST_SEEN: &str = "first_seen_utc";
pub const LAST_ONLINE: &str = "last_online";
pub const DST_PORT: &str = "dst_port";
pub const DST_PORT_NAME: &str = "dst_port_name";
pub const DST_IP: &str = "dst_ip";
pub const LIFESPAN_DAYS: &str = "lifespan_days";

/// Output column and the provider field it is read from
pub const GEO_COLUMNS: &[(&str, &str)] = &[
    ("geo_status", "status"),
    ("country", "country"),
    ("country_code", "countryCode"),
    ("region", "regionName"),
    ("city", "city"),
    ("lat", "lat"),
    ("lon", "lon"),
    ("isp", "isp"),
    ("org", "org"),
    ("asn", "as"),
    ("timezone", "timezone"),
];

/// Summary of an enrichment run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub rows: usize,
    pub unique_ips: usize,
    pub cache_hits: usize,
    pub queried_ips: usize,
    pub batches: usize,
    pub failed_lookups: usize,
}

pub fn normalize_columns(dataset: Dataset) -> Dataset {
    dataset.rename_columns(normalize_column_name)
}

/// Parse the first-seen and last-online columns into UTC timestamps.
/// Unparseable values become null.
pub fn parse_datetimes(mut dataset: Dataset) -> Dataset {
    for column in [FIRST_SEEN, LAST_ONLINE] {
        dataset = dataset.map_column(column, |cell| match cell {
            Cell::Timestamp(ts) => Cell::Timestamp(*ts),
            Cell::Str(raw) => parse_utc_timestamp(raw).map_or(Cell::Null, Cell::Timestamp),
            _ => Cell::Null,
        });
    }
    dataset
}

/// Coerce `dst_port` to integers and attach `dst_port_name`.
/// Null or non-numeric ports get a null name.
pub fn enrich_ports(dataset: Dataset, resolver: &PortNameResolver<'_>) -> Dataset {
    if !dataset.has_column(DST_PORT) {
        return dataset;
    }

    let dataset = dataset.map_column(DST_PORT, |cell| match cell {
        Cell::Int(port) => Cell::Int(*port),
        Cell::Str(raw) => coerce_int(raw).map_or(Cell::Null, Cell::Int),
        Cell::Float(v) if v.fract() == 0.0 => Cell::Int(*v as i64),
        _ => Cell::Null,
    });

    let names: Vec<Cell> = dataset
        .column(DST_PORT)
        .map(|ports| {
            ports
                .map(|cell| match cell {
                    Cell::Int(port) => Cell::Str(resolver.resolve_tcp(*port)),
                    _ => Cell::Null,
                })
                .collect()
        })
        .unwrap_or_default();

    dataset.set_column(DST_PORT_NAME, names)
}

/// Add `lifespan_days` as the whole-day span from first seen to last online.
/// Negative spans are kept.
pub fn compute_lifespan(dataset: Dataset) -> Dataset {
    let (Some(first), Some(last)) = (
        dataset.column_index(FIRST_SEEN),
        dataset.column_index(LAST_ONLINE),
    ) else {
        return dataset;
    };

    let spans: Vec<Cell> = dataset
        .rows()
        .iter()
        .map(|row| match (row[first].as_timestamp(), row[last].as_timestamp()) {
            (Some(first_seen), Some(last_online)) => {
                Cell::Int(whole_days_between(first_seen, last_online))
            }
            _ => Cell::Null,
        })
        .collect();

    dataset.set_column(LIFESPAN_DAYS, spans)
}

/// Unique, non-empty IPs of `dst_ip`, sorted
pub fn unique_ips(dataset: &Dataset) -> Vec<String> {
    dataset
        .column(DST_IP)
        .map(|cells| {
            cells
                .filter_map(Cell::as_str)
                .filter(|ip| !ip.is_empty())
                .collect::<BTreeSet<&str>>()
                .into_iter()
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve every uncached IP of `dst_ip` through `client`, saving `cache`
/// after each batch, then attach the geolocation columns.
pub async fn enrich_geolocation(
    dataset: Dataset,
    client: &BatchGeoClient,
    cache: &mut GeoCache,
    report: &mut EnrichReport,
) -> Dataset {
    let Some(ip_index) = dataset.column_index(DST_IP) else {
        return dataset;
    };

    let ips = unique_ips(&dataset);
    let to_query: Vec<String> = cache.uncached(&ips).into_iter().cloned().collect();
    report.unique_ips = ips.len();
    report.cache_hits = ips.len() - to_query.len();
    report.queried_ips = to_query.len();

    tracing::info!(
        unique = ips.len(),
        cached = report.cache_hits,
        to_query = to_query.len(),
        "Resolving destination IPs"
    );

    let mut batches = std::pin::pin!(client.query_batches(&to_query));
    while let Some(records) = batches.next().await {
        report.batches += 1;
        for record in records {
            let Some(ip) = record.get("query").and_then(Value::as_str).map(str::to_string) else {
                tracing::debug!(record = %record, "Provider record without query field");
                continue;
            };
            if is_failure(&record) {
                report.failed_lookups += 1;
            }
            cache.insert(ip, record);
        }

        if let Err(e) = cache.save().await {
            tracing::warn!(error = %e, "Failed to persist geo cache");
        }
    }

    let mut dataset = dataset;
    for (column, field) in GEO_COLUMNS {
        let values: Vec<Cell> = dataset
            .rows()
            .iter()
            .map(|row| {
                row[ip_index]
                    .as_str()
                    .and_then(|ip| cache.get(ip))
                    .map_or(Cell::Null, |record| Cell::from_json(record.get(*field)))
            })
            .collect();
        dataset = dataset.set_column(column, values);
    }

    dataset
}

/// Runs every enrichment stage over a dataset
pub struct EnrichmentPipeline {
    geo_client: BatchGeoClient,
    resolver: PortNameResolver<'static>,
    cache_path: Option<PathBuf>,
}

impl EnrichmentPipeline {
    /// Pipeline using the host's service registry and no cache file
    pub fn new(geo_client: BatchGeoClient) -> Self {
        Self {
            geo_client,
            resolver: PortNameResolver::system(),
            cache_path: None,
        }
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_port_resolver(mut self, resolver: PortNameResolver<'static>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Apply every stage in order
    pub async fn run(&self, dataset: Dataset) -> (Dataset, EnrichReport) {
        let mut report = EnrichReport {
            rows: dataset.len(),
            ..Default::default()
        };

        let dataset = normalize_columns(dataset);
        let dataset = parse_datetimes(dataset);
        let dataset = enrich_ports(dataset, &self.resolver);
        let dataset = compute_lifespan(dataset);

        let dataset = if dataset.has_column(DST_IP) {
            let mut cache = match &self.cache_path {
                Some(path) => GeoCache::load(path).await,
                None => GeoCache::in_memory(),
            };
            enrich_geolocation(dataset, &self.geo_client, &mut cache, &mut report).await
        } else {
            tracing::info!("No {} column, skipping geolocation", DST_IP);
            dataset
        };

        (dataset, report)
    }

    /// Read `input`, enrich it and write the result to `output`
    pub async fn enrich_file(&self, input: &Path, output: &Path) -> Result<EnrichReport> {
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read input {}", input.display()))?;
        let dataset = Dataset::from_csv(&bytes)
            .with_context(|| format!("Failed to parse input {}", input.display()))?;

        let (dataset, report) = self.run(dataset).await;

        ensure_parent_dir(output).await?;
        tokio::fs::write(output, dataset.to_csv()?)
            .await
            .with_context(|| format!("Failed to write output {}", output.display()))?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{MockGeoProvider, ServiceRegistry};
    use crate::enrichment::batch::failure_record;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::LazyLock;

    static REGISTRY: LazyLock<ServiceRegistry> =
        LazyLock::new(|| ServiceRegistry::parse("ssh 22/tcp\nhttps 443/tcp\n"));

    fn strs(values: &[&str]) -> Vec<Cell> {
        values.iter().map(|v| Cell::from_raw(v)).collect()
    }

    fn dataset(columns: &[&str], rows: &[&[&str]]) -> Dataset {
        Dataset::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter().map(|row| strs(row)).collect(),
        )
    }

    fn column(dataset: &Dataset, name: &str) -> Vec<Cell> {
        dataset.column(name).expect("column present").cloned().collect()
    }

    fn idle_client() -> BatchGeoClient {
        let mut provider = MockGeoProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_lookup_batch().never();
        BatchGeoClient::new(Box::new(provider), 100, 60_000).unwrap()
    }

    #[test]
    fn port_names_resolve_or_fall_back() {
        let resolver = PortNameResolver::new(&REGISTRY);
        let ds = enrich_ports(dataset(&["dst_port"], &[&["443"], &["4444"], &[""], &["n/a"]]), &resolver);

        assert_eq!(
            column(&ds, DST_PORT),
            vec![Cell::Int(443), Cell::Int(4444), Cell::Null, Cell::Null]
        );
        assert_eq!(
            column(&ds, DST_PORT_NAME),
            vec![
                Cell::Str("https".into()),
                Cell::Str("uncommon".into()),
                Cell::Null,
                Cell::Null
            ]
        );
    }

    #[test]
    fn lifespan_is_whole_days_and_keeps_sign() {
        let ds = dataset(
            &["first_seen_utc", "last_online"],
            &[
                &["2024-01-01T00:00Z", "2024-01-05T00:00Z"],
                &["2024-01-05T00:00Z", "2024-01-01T00:00Z"],
                &["2024-01-01T00:00Z", "never"],
            ],
        );
        let ds = compute_lifespan(parse_datetimes(ds));

        assert_eq!(
            column(&ds, LIFESPAN_DAYS),
            vec![Cell::Int(4), Cell::Int(-4), Cell::Null]
        );
        assert_eq!(
            column(&ds, FIRST_SEEN)[0],
            Cell::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn lifespan_needs_both_columns() {
        let ds = compute_lifespan(parse_datetimes(dataset(&["first_seen_utc"], &[&["2024-01-01"]])));
        assert!(!ds.has_column(LIFESPAN_DAYS));
    }

    #[test]
    fn unique_ips_are_deduplicated_and_sorted() {
        let ds = dataset(&["dst_ip"], &[&["2.2.2.2"], &["1.1.1.1"], &[""], &["1.1.1.1"]]);
        assert_eq!(unique_ips(&ds), vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
    }

    #[tokio::test]
    async fn queries_each_unique_ip_once() {
        let mut provider = MockGeoProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_lookup_batch()
            .withf(|ips| ips == &vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()])
            .times(1)
            .returning(|ips| {
                Ok(ips
                    .iter()
                    .map(|ip| json!({"query": ip, "status": "success", "country": "Testland", "lat": 1.5}))
                    .collect())
            });
        let client = BatchGeoClient::new(Box::new(provider), 100, 60_000).unwrap();

        let ds = dataset(&["dst_ip"], &[&["1.1.1.1"], &["2.2.2.2"], &["1.1.1.1"]]);
        let mut cache = GeoCache::in_memory();
        let mut report = EnrichReport::default();
        let ds = enrich_geolocation(ds, &client, &mut cache, &mut report).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(report.queried_ips, 2);
        assert_eq!(report.batches, 1);
        assert_eq!(column(&ds, "country"), strs(&["Testland", "Testland", "Testland"]));
        assert_eq!(column(&ds, "lat"), vec![Cell::Float(1.5); 3]);
        for (name, _) in GEO_COLUMNS {
            assert!(ds.has_column(name), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn cached_ips_are_not_requeried() {
        let mut cache = GeoCache::in_memory();
        cache.insert("1.1.1.1", json!({"query": "1.1.1.1", "status": "success", "countryCode": "AU"}));
        cache.insert("2.2.2.2", failure_record("2.2.2.2", "timed out"));

        let ds = dataset(&["dst_ip"], &[&["1.1.1.1"], &["2.2.2.2"], &[""]]);
        let mut report = EnrichReport::default();
        let ds = enrich_geolocation(ds, &idle_client(), &mut cache, &mut report).await;

        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.batches, 0);
        assert_eq!(column(&ds, "country_code"), vec![Cell::Str("AU".into()), Cell::Null, Cell::Null]);
        assert_eq!(column(&ds, "geo_status"), strs(&["success", "fail", ""]));
    }

    #[tokio::test]
    async fn failed_batch_leaves_later_batches_resolved() {
        let mut provider = MockGeoProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_lookup_batch().times(2).returning(|ips| {
            if ips.contains(&"1.1.1.1".to_string()) {
                Err(anyhow::anyhow!("provider unavailable"))
            } else {
                Ok(ips.iter().map(|ip| json!({"query": ip, "status": "success"})).collect())
            }
        });
        let client = BatchGeoClient::new(Box::new(provider), 1, 60_000).unwrap();

        let ds = dataset(&["dst_ip"], &[&["1.1.1.1"], &["2.2.2.2"]]);
        let mut cache = GeoCache::in_memory();
        let mut report = EnrichReport::default();
        let ds = enrich_geolocation(ds, &client, &mut cache, &mut report).await;

        assert_eq!(report.failed_lookups, 1);
        assert_eq!(cache.get("1.1.1.1"), Some(&failure_record("1.1.1.1", "provider unavailable")));
        assert_eq!(column(&ds, "geo_status"), strs(&["fail", "success"]));
    }

    #[tokio::test]
    async fn missing_columns_skip_their_stages() {
        let pipeline = EnrichmentPipeline::new(idle_client())
            .with_port_resolver(PortNameResolver::new(&REGISTRY));
        let ds = dataset(&["Malware", "C2 Status"], &[&["Dridex", "online"]]);

        let (ds, report) = pipeline.run(ds).await;

        assert_eq!(ds.columns(), ["malware", "c2_status"]);
        assert_eq!(report.rows, 1);
        assert_eq!(report.unique_ips, 0);
    }

    #[tokio::test]
    async fn runs_stages_over_feodo_columns() {
        let mut provider = MockGeoProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_lookup_batch().times(1).returning(|ips| {
            Ok(ips
                .iter()
                .map(|ip| json!({"query": ip, "status": "success", "as": "AS64500 Example"}))
                .collect())
        });
        let pipeline = EnrichmentPipeline::new(BatchGeoClient::new(Box::new(provider), 100, 60_000).unwrap())
            .with_port_resolver(PortNameResolver::new(&REGISTRY));

        let ds = dataset(
            &["First Seen UTC", "Dst-IP", "Dst Port", "Last Online"],
            &[&["2024-01-01 00:00:00", "1.1.1.1", "22", "2024-01-03"]],
        );
        let (ds, _) = pipeline.run(ds).await;

        assert_eq!(&ds.columns()[..5], ["first_seen_utc", "dst_ip", "dst_port", "last_online", "dst_port_name"]);
        assert_eq!(column(&ds, DST_PORT_NAME), strs(&["ssh"]));
        assert_eq!(column(&ds, LIFESPAN_DAYS), vec![Cell::Int(2)]);
        assert_eq!(column(&ds, "asn"), strs(&["AS64500 Example"]));
    }
}
