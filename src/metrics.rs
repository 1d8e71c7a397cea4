//! Prometheus counters for one cache instance.
//!
//! Each instance owns its registry, so several caches (or tests) in one
//! process never collide on metric names.

use prometheus::{IntCounter, Registry, TextEncoder};

pub struct CacheMetrics {
    registry: Registry,
    /// Non-empty `fetch_range` calls with a valid range.
    pub requests: IntCounter,
    /// Requests answered without calling the fetcher.
    pub hits: IntCounter,
    /// Calls made to the fetcher.
    pub fetch_calls: IntCounter,
    /// Bytes written into the backing store from the fetcher.
    pub fetched_bytes: IntCounter,
    pub fetch_failures: IntCounter,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounter::new("smmap_requests_total", "Range requests served")?;
        let hits = IntCounter::new("smmap_hits_total", "Range requests served without fetching")?;
        let fetch_calls = IntCounter::new("smmap_fetch_calls_total", "Calls to the backing fetcher")?;
        let fetched_bytes =
            IntCounter::new("smmap_fetched_bytes_total", "Bytes fetched into the cache")?;
        let fetch_failures =
            IntCounter::new("smmap_fetch_failures_total", "Failed calls to the backing fetcher")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(fetch_calls.clone()))?;
        registry.register(Box::new(fetched_bytes.clone()))?;
        registry.register(Box::new(fetch_failures.clone()))?;

        Ok(Self {
            registry,
            requests,
            hits,
            fetch_calls,
            fetched_bytes,
            fetch_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all counters in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
