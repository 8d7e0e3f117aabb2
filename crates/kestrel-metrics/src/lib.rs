//! # Kestrel Metrics
//!
//! Observability for the resolver pipeline: counters recorded through the
//! [`metrics`] facade and a `tracing` subscriber setup.
//!
//! ## Features
//!
//! - **Counters**: queries, responses by rcode, cache hits per view, prefetch
//!   activity, recursion outcomes and upstream traffic
//! - **Structured logging**: text or JSON output filtered by `RUST_LOG`
//!
//! No exporter is installed here; any `metrics` recorder the binary installs
//! receives the counters.

use metrics::{counter, gauge, histogram};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub mod tracing_setup;

/// Global metrics instance.
static METRICS: OnceCell<DnsMetrics> = OnceCell::new();

/// Gets or initializes the global metrics instance.
pub fn metrics() -> &'static DnsMetrics {
    METRICS.get_or_init(DnsMetrics::new)
}

/// Resolver metrics.
pub struct DnsMetrics {
    start_time: Instant,
    queries_total: AtomicU64,
    responses_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl DnsMetrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            queries_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Returns the server uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Total queries received.
    pub fn queries(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    /// Total responses sent.
    pub fn responses(&self) -> u64 {
        self.responses_total.load(Ordering::Relaxed)
    }

    /// Cache hits across all views.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache misses across all views.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Query metrics
    // =========================================================================

    /// Records a received query.
    pub fn record_query(&self, protocol: &str, view: &str) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        counter!("dns_queries_total", "protocol" => protocol.to_string(), "view" => view.to_string())
            .increment(1);
    }

    /// Records a sent response.
    pub fn record_response(&self, protocol: &str, rcode: &str) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
        counter!("dns_responses_total", "protocol" => protocol.to_string(), "rcode" => rcode.to_string())
            .increment(1);
    }

    /// Records query latency.
    pub fn record_latency(&self, protocol: &str, duration: Duration) {
        histogram!("dns_query_duration_seconds", "protocol" => protocol.to_string())
            .record(duration.as_secs_f64());
    }

    // =========================================================================
    // Cache metrics
    // =========================================================================

    /// Records a cache hit in a view.
    pub fn record_cache_hit(&self, view: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("dns_cache_hits_total", "view" => view.to_string()).increment(1);
    }

    /// Records a cache miss in a view.
    pub fn record_cache_miss(&self, view: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("dns_cache_misses_total", "view" => view.to_string()).increment(1);
    }

    /// Updates the cache size gauge of a view.
    pub fn set_cache_size(&self, view: &str, size: usize) {
        gauge!("dns_cache_entries", "view" => view.to_string()).set(size as f64);
    }

    /// Records a prefetch task handed to the worker.
    pub fn record_prefetch(&self) {
        counter!("dns_cache_prefetches_total").increment(1);
    }

    /// Records a prefetch task dropped because the queue was full.
    pub fn record_prefetch_dropped(&self) {
        counter!("dns_cache_prefetches_dropped_total").increment(1);
    }

    // =========================================================================
    // Resolution metrics
    // =========================================================================

    /// Records the outcome of a recursive resolution.
    pub fn record_recursion(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        counter!("dns_recursions_total", "result" => result).increment(1);
    }

    /// Records a query dropped by the concurrency limiter.
    pub fn record_query_limited(&self) {
        counter!("dns_queries_limited_total").increment(1);
    }

    /// Updates the number of zones held by the nameserver address store.
    pub fn set_nsas_zones(&self, count: usize) {
        gauge!("dns_nsas_zones").set(count as f64);
    }

    // =========================================================================
    // Upstream metrics
    // =========================================================================

    /// Records an upstream query.
    pub fn record_upstream_query(&self, upstream: &str) {
        counter!("dns_upstream_queries_total", "upstream" => upstream.to_string()).increment(1);
    }

    /// Records upstream latency.
    pub fn record_upstream_latency(&self, upstream: &str, duration: Duration) {
        histogram!("dns_upstream_duration_seconds", "upstream" => upstream.to_string())
            .record(duration.as_secs_f64());
    }

    /// Records an upstream failure.
    pub fn record_upstream_failure(&self, upstream: &str, error: &str) {
        counter!("dns_upstream_failures_total", "upstream" => upstream.to_string(), "error" => error.to_string())
            .increment(1);
    }
}

impl Default for DnsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Query timing helper.
pub struct QueryTimer {
    start: Instant,
    protocol: &'static str,
}

impl QueryTimer {
    /// Starts a new query timer.
    pub fn start(protocol: &'static str) -> Self {
        Self {
            start: Instant::now(),
            protocol,
        }
    }

    /// Returns the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finishes timing and records the latency.
    pub fn finish(self) {
        metrics().record_latency(self.protocol, self.elapsed());
    }
}
