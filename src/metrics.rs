use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_served: AtomicU64,
    api_requests: AtomicU64,
    retries: AtomicU64,
    issues_created: AtomicU64,
    bulk_jobs: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub stale_served: u64,
    pub api_requests: u64,
    pub retries: u64,
    pub issues_created: u64,
    pub bulk_jobs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_api_request(&self) {
        self.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_issues_created(&self, count: u64) {
        self.issues_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_bulk_job(&self) {
        self.bulk_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            api_requests: self.api_requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            issues_created: self.issues_created.load(Ordering::Relaxed),
            bulk_jobs: self.bulk_jobs.load(Ordering::Relaxed),
        }
    }
}

pub fn spawn_metrics_logger(metrics: Arc<Metrics>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        let snap = metrics.snapshot();
        eprintln!(
            "metrics cache_hit={} cache_miss={} stale_served={} api_requests={} retries={} issues_created={} bulk_jobs={}",
            snap.cache_hits,
            snap.cache_misses,
            snap.stale_served,
            snap.api_requests,
            snap.retries,
            snap.issues_created,
            snap.bulk_jobs
        );
    });
}
