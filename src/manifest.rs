use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::logging;

const MANIFEST_KEY_PREFIX: &str = "bulk:manifest:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Why one row failed: the HTTP status (when Jira answered) and Jira's
/// per-field messages.
pub struct RowError {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

impl RowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: None,
            errors: BTreeMap::from([("validation".to_string(), message.into())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Durable per-row record of a bulk job, enough to retry only the rows that
/// failed. `timestamp` is never rewritten after the initial store.
pub struct BulkManifest {
    pub id: String,
    pub timestamp: String,
    pub total: usize,
    pub succeeded: Vec<usize>,
    pub failed: Vec<usize>,
    pub created: BTreeMap<usize, String>,
    pub errors: BTreeMap<usize, RowError>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uid_map: BTreeMap<String, String>,
}

impl BulkManifest {
    pub fn new(id: impl Into<String>, total: usize) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now().to_rfc3339(),
            total,
            succeeded: Vec::new(),
            failed: Vec::new(),
            created: BTreeMap::new(),
            errors: BTreeMap::new(),
            uid_map: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, index: usize, key: impl Into<String>) {
        if !self.succeeded.contains(&index) {
            self.succeeded.push(index);
            self.succeeded.sort_unstable();
        }
        self.failed.retain(|&i| i != index);
        self.errors.remove(&index);
        self.created.insert(index, key.into());
    }

    pub fn record_failure(&mut self, index: usize, error: RowError) {
        if !self.failed.contains(&index) {
            self.failed.push(index);
            self.failed.sort_unstable();
        }
        self.errors.insert(index, error);
    }

    /// Time elapsed since the manifest was first stored, when the stored
    /// timestamp is parseable.
    pub fn age(&self) -> Option<chrono::Duration> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|stored| Utc::now().signed_duration_since(stored))
    }
}

/// Globally-unique job id; hierarchical jobs are tagged for operators.
pub fn new_manifest_id(hierarchical: bool) -> String {
    if hierarchical {
        format!("bulk-hier-{}", Uuid::new_v4())
    } else {
        format!("bulk-{}", Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Default)]
/// Per-row outcomes of one retry pass, merged into an existing manifest.
pub struct ManifestDelta {
    pub succeeded: Vec<usize>,
    pub failed: Vec<usize>,
    pub created: BTreeMap<usize, String>,
    pub errors: BTreeMap<usize, RowError>,
    pub uid_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    cache: Arc<Cache>,
    ttl_secs: u64,
}

impl ManifestStore {
    pub fn new(cache: Arc<Cache>, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }

    fn key(id: &str) -> String {
        format!("{MANIFEST_KEY_PREFIX}{id}")
    }

    /// Stores the manifest. Write failures are logged, never raised.
    pub fn save(&self, manifest: &BulkManifest) {
        match serde_json::to_string(manifest) {
            Ok(encoded) => self.cache.set(&Self::key(&manifest.id), &encoded, self.ttl_secs),
            Err(err) => {
                logging::warn(format!(
                    "failed to encode manifest {}: {}",
                    manifest.id, err
                ));
            }
        }
    }

    /// Loads a manifest; expired, missing, and unreachable all read as `None`.
    pub fn load(&self, id: &str) -> Option<BulkManifest> {
        let raw = self.cache.get(&Self::key(id))?;
        match serde_json::from_str(&raw.value) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                logging::warn(format!("failed to decode manifest {id}: {err}"));
                None
            }
        }
    }

    /// Merges one retry pass into the stored manifest: succeeded and created
    /// union in, failed is replaced, errors under newly-succeeded rows are
    /// dropped, and the original timestamp is preserved.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] when the manifest is gone.
    pub fn update(&self, id: &str, delta: &ManifestDelta) -> Result<BulkManifest> {
        let mut manifest = self
            .load(id)
            .ok_or_else(|| Error::not_found(format!("Manifest {id} not found or expired")))?;

        let mut succeeded: BTreeSet<usize> = manifest.succeeded.iter().copied().collect();
        succeeded.extend(delta.succeeded.iter().copied());
        manifest.succeeded = succeeded.iter().copied().collect();

        for (index, key) in &delta.created {
            manifest.created.insert(*index, key.clone());
        }

        let failed: BTreeSet<usize> = delta
            .failed
            .iter()
            .copied()
            .filter(|index| !succeeded.contains(index))
            .collect();
        manifest.errors.retain(|index, _| failed.contains(index));
        for (index, error) in &delta.errors {
            if failed.contains(index) {
                manifest.errors.insert(*index, error.clone());
            }
        }
        manifest.failed = failed.into_iter().collect();

        for (uid, key) in &delta.uid_map {
            manifest.uid_map.insert(uid.clone(), key.clone());
        }

        self.save(&manifest);
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn store() -> ManifestStore {
        ManifestStore::new(Arc::new(Cache::in_memory(Arc::new(Metrics::new()))), 3600)
    }

    #[test]
    fn manifest_ids_carry_the_job_shape() {
        let flat = new_manifest_id(false);
        let hier = new_manifest_id(true);
        assert!(flat.starts_with("bulk-"));
        assert!(!flat.starts_with("bulk-hier-"));
        assert!(hier.starts_with("bulk-hier-"));
        assert_ne!(new_manifest_id(false), new_manifest_id(false));
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = store();
        let mut manifest = BulkManifest::new("bulk-test-1", 3);
        manifest.record_success(0, "ENG-1");
        manifest.record_failure(1, RowError::validation("Unknown issue type"));
        manifest.record_success(2, "ENG-2");
        manifest.uid_map.insert("e1".to_string(), "ENG-1".to_string());

        store.save(&manifest);
        let loaded = store.load("bulk-test-1").expect("present");
        assert_eq!(loaded, manifest);
        assert!(store.load("bulk-unknown").is_none());
    }

    #[test]
    fn success_and_failure_sets_stay_disjoint() {
        let mut manifest = BulkManifest::new("bulk-test-2", 2);
        manifest.record_failure(0, RowError::validation("first attempt"));
        manifest.record_success(0, "ENG-10");

        assert_eq!(manifest.succeeded, vec![0]);
        assert!(manifest.failed.is_empty());
        assert!(manifest.errors.is_empty());
        assert_eq!(manifest.created.get(&0).map(String::as_str), Some("ENG-10"));
    }

    #[test]
    fn update_merges_a_retry_pass() {
        let store = store();
        let mut manifest = BulkManifest::new("bulk-test-3", 3);
        manifest.record_success(0, "ENG-1");
        manifest.record_success(2, "ENG-2");
        manifest.record_failure(1, RowError::validation("Unknown issue type"));
        let original_timestamp = manifest.timestamp.clone();
        store.save(&manifest);

        let delta = ManifestDelta {
            succeeded: vec![1],
            failed: vec![],
            created: BTreeMap::from([(1, "ENG-3".to_string())]),
            errors: BTreeMap::new(),
            uid_map: BTreeMap::new(),
        };
        let merged = store.update("bulk-test-3", &delta).expect("update");

        assert_eq!(merged.succeeded, vec![0, 1, 2]);
        assert!(merged.failed.is_empty());
        assert!(merged.errors.is_empty());
        assert_eq!(merged.created.len(), 3);
        assert_eq!(merged.timestamp, original_timestamp);
        assert_eq!(merged.id, "bulk-test-3");

        let reloaded = store.load("bulk-test-3").expect("saved");
        assert_eq!(reloaded, merged);
    }

    #[test]
    fn update_keeps_rows_that_fail_again() {
        let store = store();
        let mut manifest = BulkManifest::new("bulk-test-4", 2);
        manifest.record_success(0, "ENG-1");
        manifest.record_failure(1, RowError::validation("old message"));
        store.save(&manifest);

        let delta = ManifestDelta {
            succeeded: vec![],
            failed: vec![1],
            created: BTreeMap::new(),
            errors: BTreeMap::from([(1, RowError::validation("new message"))]),
            uid_map: BTreeMap::new(),
        };
        let merged = store.update("bulk-test-4", &delta).expect("update");

        assert_eq!(merged.failed, vec![1]);
        assert_eq!(
            merged.errors.get(&1).and_then(|e| e.errors.get("validation")).map(String::as_str),
            Some("new message")
        );
    }

    #[test]
    fn update_of_a_missing_manifest_is_not_found() {
        let err = store()
            .update("bulk-gone", &ManifestDelta::default())
            .expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND_ERROR");
        assert!(err.to_string().contains("bulk-gone"));
    }
}
