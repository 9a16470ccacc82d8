//! `jml` creates and queries Jira Server issues using human-readable field
//! names and values. Callers submit records like
//! `{"Project": "Engineering", "Issue Type": "Bug", "Priority": "P1 - Critical"}`;
//! the library discovers the project's field schema, resolves friendly names
//! and values to the identifiers the REST API requires, and issues single or
//! bulk create calls with durable per-row manifests and retry.

/// Unified create engine: single, bulk, hierarchy, and retry paths.
pub mod bulk;
/// Stale-while-revalidate cache over memory or SQLite stores.
pub mod cache;
/// Runtime configuration loading and validation.
pub mod config;
/// Type-dispatched value converters from friendly values to wire shapes.
pub mod convert;
/// The library's error taxonomy.
pub mod error;
/// UID detection and topological ordering of parent-child input.
pub mod hierarchy;
/// Bounded-concurrency Jira REST client with retries.
pub mod http;
/// CSV/JSON/YAML input parsing into sanitized records.
pub mod input;
/// Issue operations exposed on a connected handle.
pub mod issues;
/// Logging helpers used throughout the crate.
pub mod logging;
/// Durable bulk-job manifests.
pub mod manifest;
/// Runtime metrics counters.
pub mod metrics;
/// Marker-label progress tracking for bulk jobs.
pub mod progress;
/// Createmeta schema discovery and friendly-name resolution.
pub mod schema;
/// JQL generation and issue search.
pub mod search;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use bulk::{
    BulkResult, CreateInput, CreateOptions, CreateOutcome, CreatedIssue, RowResult,
};
pub use config::Config;
pub use error::{Error, Result};
pub use manifest::BulkManifest;
pub use search::{SearchRequest, SearchResult};

use bulk::BulkEngine;
use cache::Cache;
use http::HttpClient;
use issues::Issues;
use metrics::{Metrics, MetricsSnapshot};
use search::SearchService;

/// A connected library handle. Holds the HTTP client, the cache, and the
/// process-wide counters; dropped state is torn down by [`Jml::disconnect`].
#[derive(Debug)]
pub struct Jml {
    issues: Issues,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
}

/// Validates the configuration and builds a connected handle.
///
/// # Errors
/// Returns [`Error::Configuration`] for invalid settings and
/// [`Error::Cache`] when the configured cache store cannot be opened.
pub fn connect(config: Config) -> Result<Jml> {
    config.validate()?;

    if config.logging.debug {
        logging::set_debug(true);
    }

    let metrics = Arc::new(Metrics::new());
    if let Some(interval_secs) = config.metrics.log_interval_secs {
        metrics::spawn_metrics_logger(
            Arc::clone(&metrics),
            Duration::from_secs(interval_secs),
        );
    }
    let cache = match config.cache.db_path.as_deref() {
        Some(path) => Cache::persistent(Path::new(path), Arc::clone(&metrics))?,
        None => Cache::in_memory(Arc::clone(&metrics)),
    };
    let cache = Arc::new(cache);

    let http = Arc::new(HttpClient::new(
        &config.jira.base_url,
        &config.jira.token,
        config.jira.api_version,
        Duration::from_secs(config.timeout.request_secs),
        Duration::from_secs(config.timeout.bulk_request_secs),
        Arc::clone(&metrics),
    )?);

    let config = Arc::new(config);
    let engine = BulkEngine::new(
        Arc::clone(&http),
        Arc::clone(&cache),
        Arc::clone(&config),
        Arc::clone(&metrics),
    );
    let search = SearchService::new(http);

    Ok(Jml {
        issues: Issues::new(engine, search),
        cache,
        metrics,
    })
}

impl Jml {
    pub fn issues(&self) -> &Issues {
        &self.issues
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drops every cached value under the library's namespaces.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Tears the handle down and releases the cache store.
    pub fn disconnect(self) {
        logging::debug("disconnecting; releasing cache store");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    #[test]
    fn connect_rejects_invalid_configuration() {
        let err = connect(Config::new("", "token")).expect_err("empty base url");
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn connected_handle_searches_and_disconnects() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/search");
            then.status(200).json_body_obj(&json!({
                "total": 1,
                "issues": [
                    {"key": "ENG-1", "fields": {"summary": "Found", "status": {"name": "Open"}}}
                ]
            }));
        });

        let jml = connect(Config::new(server.base_url(), "token")).expect("connect");
        let result = jml
            .issues()
            .search(&SearchRequest::raw("project = ENG"))
            .expect("search");
        assert_eq!(result.total, 1);
        assert_eq!(result.issues[0].key, "ENG-1");
        assert!(jml.metrics().api_requests >= 1);
        jml.disconnect();
    }

    #[test]
    fn connect_opens_a_durable_cache_when_configured() {
        let mut config = Config::new("https://jira.example.com", "token");
        config.cache.db_path = Some(":memory:".to_string());
        let jml = connect(config).expect("connect");
        jml.clear_cache();
        jml.disconnect();
    }

    #[test]
    fn connect_spawns_the_metrics_logger_when_configured() {
        let mut config = Config::new("https://jira.example.com", "token");
        config.metrics.log_interval_secs = Some(60);
        let jml = connect(config).expect("connect");
        assert_eq!(jml.metrics().api_requests, 0);
        jml.disconnect();
    }
}
