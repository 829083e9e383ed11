//! Flat-file storage for IP enrichment results

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

/// Provider status marking a lookup that failed
pub const STATUS_FAIL: &str = "fail";

/// Persistent mapping from IP address to the last provider record seen for it.
///
/// Failure markers (`status == "fail"`) are cached like any other entry, so a
/// failed IP is not queried again until the file is edited or removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Value>,
}

impl GeoCache {
    /// An empty cache that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache at `path`. A missing, unreadable or malformed file
    /// yields an empty cache bound to the same path.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, Value>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable geo cache");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read geo cache");
                BTreeMap::new()
            }
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Loaded geo cache");

        Self {
            path: Some(path),
            entries,
        }
    }

    /// Write the full mapping to the backing file, replacing it
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        ensure_parent_dir(path).await?;
        let body = serde_json::to_vec_pretty(&self.entries).context("Failed to serialize geo cache")?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("Failed to write geo cache {}", path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ip: &str) -> Option<&Value> {
        self.entries.get(ip)
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.entries.contains_key(ip)
    }

    /// Store a record for `ip` unless one is already present.
    /// Returns whether the record was stored.
    pub fn insert(&mut self, ip: impl Into<String>, record: Value) -> bool {
        match self.entries.entry(ip.into()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// The IPs from `ips` that have no entry yet, in input order
    pub fn uncached<'a>(&self, ips: &'a [String]) -> Vec<&'a String> {
        ips.iter().filter(|ip| !self.contains(ip)).collect()
    }

    /// Number of cached entries marked as failed
    pub fn failed_count(&self) -> usize {
        self.entries.values().filter(|v| is_failure(v)).count()
    }
}

/// True for failure markers, whether synthesized or returned by the provider
pub fn is_failure(record: &Value) -> bool {
    record.get("status").and_then(Value::as_str) == Some(STATUS_FAIL)
}

/// Create the parent directory of `path` if it has one
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("feodoforge-cache-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let cache = GeoCache::load(scratch_dir().join("absent.json")).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("cache.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let cache = GeoCache::load(&path).await;
        assert!(cache.is_empty());
        assert_eq!(cache.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let path = scratch_dir().join("nested").join("ip_geo_cache.json");
        let mut cache = GeoCache::load(&path).await;
        cache.insert("1.1.1.1", json!({"status": "success", "country": "Australia", "lat": -33.494}));
        cache.insert("2.2.2.2", json!({"query": "2.2.2.2", "status": "fail", "message": "timeout"}));
        assert_ok!(cache.save().await);

        let reloaded = GeoCache::load(&path).await;
        assert_eq!(reloaded, cache);

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("\n  \"1.1.1.1\": {"), "expected pretty JSON, got {}", text);
    }

    #[test]
    fn first_entry_wins() {
        let mut cache = GeoCache::in_memory();
        assert!(cache.insert("1.1.1.1", json!({"status": "fail"})));
        assert!(!cache.insert("1.1.1.1", json!({"status": "success"})));
        assert_eq!(cache.get("1.1.1.1"), Some(&json!({"status": "fail"})));
    }

    #[test]
    fn failed_entries_count_as_cached() {
        let mut cache = GeoCache::in_memory();
        cache.insert("1.1.1.1", json!({"query": "1.1.1.1", "status": "fail", "message": "boom"}));

        let ips = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];
        assert_eq!(cache.uncached(&ips), vec![&ips[1]]);
        assert_eq!(cache.failed_count(), 1);
    }
}
