pub mod store;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::logging;
use crate::metrics::Metrics;
use store::{unix_now, CacheStore, MemoryStore, SqliteStore, StoredEntry};

/// Namespace prefixes owned by the library. `clear()` removes these and
/// nothing else.
const NAMESPACES: [&str; 2] = ["jml:", "bulk:manifest:"];

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a cache read: the value plus whether its soft TTL has passed.
pub struct Lookup {
    pub value: String,
    pub is_stale: bool,
}

/// Stale-while-revalidate cache over a pluggable key-value store.
///
/// Values are served fresh until their soft expiry, served with
/// `is_stale = true` until their hard expiry (2x the TTL), and absent after
/// that. A backing-store outage never propagates: reads degrade to misses
/// and writes to no-ops, with a logged warning.
pub struct Cache {
    store: Box<dyn CacheStore>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Arc<Metrics>,
}

impl Cache {
    pub fn in_memory(metrics: Arc<Metrics>) -> Self {
        Self {
            store: Box::new(MemoryStore::new()),
            inflight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Opens a SQLite-backed cache at `path`.
    ///
    /// # Errors
    /// Returns [`Error::Cache`] when the database cannot be opened.
    pub fn persistent(path: &Path, metrics: Arc<Metrics>) -> Result<Self> {
        let store = SqliteStore::new(path)
            .map_err(|err| Error::cache(format!("failed to open cache store: {err}")))?;
        Ok(Self {
            store: Box::new(store),
            inflight: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    pub fn get(&self, key: &str) -> Option<Lookup> {
        let entry = match self.store.get(key) {
            Ok(found) => found,
            Err(err) => {
                logging::warn(format!("cache get failed for {key}: {err}"));
                self.metrics.inc_cache_miss();
                return None;
            }
        };

        let now = unix_now();
        match entry {
            Some(entry) if entry.hard_expires_at > now => {
                let is_stale = entry.soft_expires_at <= now;
                if is_stale {
                    self.metrics.inc_stale_served();
                } else {
                    self.metrics.inc_cache_hit();
                }
                Some(Lookup {
                    value: entry.value,
                    is_stale,
                })
            }
            _ => {
                self.metrics.inc_cache_miss();
                None
            }
        }
    }

    /// Read that treats a stale value as a miss.
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(lookup) if !lookup.is_stale => Some(lookup.value),
            _ => None,
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl_secs: u64) {
        let now = unix_now();
        self.set_raw(key, value, now + ttl_secs, now + 2 * ttl_secs);
    }

    fn set_raw(&self, key: &str, value: &str, soft_expires_at: u64, hard_expires_at: u64) {
        let entry = StoredEntry {
            value: value.to_string(),
            soft_expires_at,
            hard_expires_at,
        };
        if let Err(err) = self.store.set(key, entry) {
            logging::warn(format!("cache set failed for {key}: {err}"));
        }
    }

    pub fn delete(&self, key: &str) {
        if let Err(err) = self.store.delete(key) {
            logging::warn(format!("cache delete failed for {key}: {err}"));
        }
    }

    /// Removes every key under the library's namespaces.
    pub fn clear(&self) {
        for namespace in NAMESPACES {
            let keys = match self.store.keys(namespace) {
                Ok(keys) => keys,
                Err(err) => {
                    logging::warn(format!("cache scan failed for {namespace}: {err}"));
                    continue;
                }
            };
            for key in keys {
                self.delete(&key);
            }
        }
    }

    pub fn ping(&self) -> bool {
        match self.store.ping() {
            Ok(()) => true,
            Err(err) => {
                logging::warn(format!("cache ping failed: {err}"));
                false
            }
        }
    }

    /// Runs `fetch` at most once concurrently per key.
    ///
    /// The first caller to arrive for a key becomes the leader: it runs
    /// `fetch`, writes the result under `key`, and returns it. Callers that
    /// arrive while the leader is in flight block on the per-key guard and
    /// then observe the freshly-written value without invoking `fetch`. When
    /// the leader fails, the next waiter retries the fetch itself.
    pub fn refresh_once<F>(&self, key: &str, ttl_secs: u64, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        let guard_slot = {
            let mut inflight = lock_or_recover(&self.inflight, "cache inflight map");
            Arc::clone(inflight.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = lock_or_recover(&guard_slot, "cache refresh guard");
            if let Some(value) = self.get_fresh(key) {
                Ok(value)
            } else {
                let value = fetch()?;
                self.set(key, &value, ttl_secs);
                Ok(value)
            }
        };

        let mut inflight = lock_or_recover(&self.inflight, "cache inflight map");
        if let Some(slot) = inflight.get(key) {
            // One reference in the map plus our local clone means no waiter
            // is queued behind us.
            if Arc::strong_count(slot) <= 2 {
                inflight.remove(key);
            }
        }

        result
    }

    #[cfg(test)]
    pub(crate) fn set_with_expiries(
        &self,
        key: &str,
        value: &str,
        soft_expires_at: u64,
        hard_expires_at: u64,
    ) {
        self.set_raw(key, value, soft_expires_at, hard_expires_at);
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("durable", &self.store.is_durable())
            .finish()
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            logging::warn(format!("recovering poisoned mutex: {}", name));
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn cache() -> Cache {
        Cache::in_memory(Arc::new(Metrics::new()))
    }

    #[test]
    fn fresh_value_is_served_without_stale_flag() {
        let cache = cache();
        cache.set("jml:k", "v", 60);

        let lookup = cache.get("jml:k").expect("present");
        assert_eq!(lookup.value, "v");
        assert!(!lookup.is_stale);
        assert_eq!(cache.get_fresh("jml:k").as_deref(), Some("v"));
    }

    #[test]
    fn stale_value_is_served_with_flag_until_hard_expiry() {
        let cache = cache();
        let now = unix_now();
        cache.set_with_expiries("jml:k", "v", now.saturating_sub(5), now + 60);

        let lookup = cache.get("jml:k").expect("within hard window");
        assert_eq!(lookup.value, "v");
        assert!(lookup.is_stale);
        assert!(cache.get_fresh("jml:k").is_none(), "stale rejects as miss");

        cache.set_with_expiries("jml:k", "v", now.saturating_sub(10), now.saturating_sub(5));
        assert!(cache.get("jml:k").is_none(), "absent past hard expiry");
    }

    #[test]
    fn clear_removes_only_library_namespaces() {
        let cache = cache();
        cache.set("jml:schema:a", "1", 60);
        cache.set("bulk:manifest:b", "2", 60);
        cache.set("unrelated:c", "3", 60);

        cache.clear();

        assert!(cache.get("jml:schema:a").is_none());
        assert!(cache.get("bulk:manifest:b").is_none());
        assert_eq!(cache.get("unrelated:c").map(|l| l.value).as_deref(), Some("3"));
    }

    #[test]
    fn refresh_once_runs_fetch_exactly_once_across_threads() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .refresh_once("jml:schema:k", 60, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(50));
                            Ok("fetched".to_string())
                        })
                        .expect("refresh")
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().expect("join"), "fetched");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_once_skips_fetch_when_value_is_fresh() {
        let cache = cache();
        cache.set("jml:k", "existing", 60);

        let value = cache
            .refresh_once("jml:k", 60, || {
                panic!("fetch must not run for a fresh key");
            })
            .expect("refresh");
        assert_eq!(value, "existing");
    }

    #[test]
    fn refresh_once_replaces_a_stale_value() {
        let cache = cache();
        let now = unix_now();
        cache.set_with_expiries("jml:k", "old", now.saturating_sub(5), now + 60);

        let value = cache
            .refresh_once("jml:k", 60, || Ok("new".to_string()))
            .expect("refresh");
        assert_eq!(value, "new");

        let lookup = cache.get("jml:k").expect("present");
        assert_eq!(lookup.value, "new");
        assert!(!lookup.is_stale);
    }

    #[test]
    fn refresh_once_propagates_fetch_errors() {
        let cache = cache();
        let err = cache
            .refresh_once("jml:k", 60, || Err(Error::network("boom")))
            .expect_err("fetch error should surface");
        assert_eq!(err.code(), "NETWORK_ERROR");
        assert!(cache.get("jml:k").is_none(), "nothing cached on failure");
    }

    #[test]
    fn persistent_cache_round_trips() {
        let cache = Cache::persistent(Path::new(":memory:"), Arc::new(Metrics::new()))
            .expect("open cache");
        assert!(cache.is_durable());
        assert!(cache.ping());

        cache.set("bulk:manifest:x", "{}", 60);
        assert_eq!(
            cache.get("bulk:manifest:x").map(|l| l.value).as_deref(),
            Some("{}")
        );
    }
}
