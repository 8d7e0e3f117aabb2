//! Forwarding upstream bookkeeping.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive failures after which an upstream is taken out of rotation
/// until a probe gets an answer from it.
pub const UNHEALTHY_AFTER_FAILURES: u64 = 3;

/// One upstream resolver of a forward zone.
#[derive(Debug)]
pub struct Upstream {
    address: SocketAddr,
    /// Number of successful queries.
    successes: AtomicU64,
    /// Failures since the last success.
    failures: AtomicU64,
    /// Smoothed latency (microseconds).
    latency_us: AtomicU64,
    healthy: AtomicBool,
    probing: AtomicBool,
}

impl Upstream {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            probing: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Records a successful query.
    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);

        let sample = latency.as_micros() as u64;
        let _ = self
            .latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                // EMA with alpha = 0.125
                Some(if current == 0 {
                    sample
                } else {
                    (current * 7 + sample) / 8
                })
            });

        self.healthy.store(true, Ordering::Relaxed);
    }

    /// Records a failed query. Returns true if the upstream is now down.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= UNHEALTHY_AFTER_FAILURES {
            self.healthy.store(false, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Claims the upstream for probing. False if a probe is already queued.
    pub(crate) fn begin_probe(&self) -> bool {
        !self.probing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_probe(&self) {
        self.probing.store(false, Ordering::Release);
    }

    /// Returns the smoothed latency.
    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }
}

/// The upstreams serving one forward zone.
#[derive(Debug)]
pub struct UpstreamGroup {
    upstreams: Vec<Arc<Upstream>>,
}

impl UpstreamGroup {
    pub fn new(addresses: &[SocketAddr]) -> Self {
        Self {
            upstreams: addresses.iter().map(|a| Arc::new(Upstream::new(*a))).collect(),
        }
    }

    /// Healthy upstreams, fastest first.
    pub fn available(&self) -> Vec<Arc<Upstream>> {
        let mut upstreams: Vec<Arc<Upstream>> =
            self.upstreams.iter().filter(|u| u.is_healthy()).cloned().collect();
        upstreams.sort_by_key(|u| u.average_latency());
        upstreams
    }

    pub fn all(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
