//! Health probing of forwarding upstreams that stopped answering.
//!
//! A down upstream is left out of forwarding until a probe, the query that
//! last failed against it, is answered again.

use crate::recursor::transport::Transport;
use crate::upstream::Upstream;
use futures::future::join_all;
use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

/// Upstreams probed per tick.
pub const PROBE_BATCH: usize = 10;

/// Default time between probe rounds.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

struct Target {
    upstream: Arc<Upstream>,
    source: Option<IpAddr>,
    request: Message,
}

type Targets = Arc<Mutex<VecDeque<Target>>>;

/// Probe queue and its worker. Dropping it stops the worker.
pub struct Prober {
    targets: Targets,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Prober {
    /// Starts a worker that probes queued upstreams every `interval`, each
    /// probe bounded by `limit`.
    pub fn spawn(transport: Arc<dyn Transport>, interval: Duration, limit: Duration) -> Self {
        let targets: Targets = Arc::new(Mutex::new(VecDeque::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(probe_worker(
            Arc::clone(&targets),
            shutdown_rx,
            transport,
            interval.max(Duration::from_millis(1)),
            limit,
        ));

        Self {
            targets,
            shutdown,
            worker,
        }
    }

    /// Queues `upstream` for probing with `request`. Returns false if it is
    /// already being probed.
    pub fn add(&self, upstream: Arc<Upstream>, source: Option<IpAddr>, request: &Message) -> bool {
        if !upstream.begin_probe() {
            return false;
        }
        warn!(upstream = %upstream.address(), "Upstream is down");
        self.targets.lock().push_back(Target {
            upstream,
            source,
            request: request.clone(),
        });
        true
    }

    /// Number of upstreams waiting for their next probe.
    pub fn pending(&self) -> usize {
        self.targets.lock().len()
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Probe worker ended abnormally");
        }
    }
}

async fn probe_worker(
    targets: Targets,
    mut shutdown: watch::Receiver<bool>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    limit: Duration,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let batch: Vec<Target> = {
            let mut targets = targets.lock();
            let n = targets.len().min(PROBE_BATCH);
            targets.drain(..n).collect()
        };
        if batch.is_empty() {
            continue;
        }

        let still_down = join_all(batch.into_iter().map(|t| probe(transport.as_ref(), t, limit))).await;
        targets.lock().extend(still_down.into_iter().flatten());
    }
}

/// Sends one probe. Returns the target if the upstream is still down.
async fn probe(transport: &dyn Transport, target: Target, limit: Duration) -> Option<Target> {
    let mut request = target.request.clone();
    request.set_id(rand::random());

    let address = target.upstream.address();
    match timeout(limit, transport.query(address, target.source, &request)).await {
        Ok(Ok((response, rtt))) if response.response_code() != ResponseCode::ServFail => {
            target.upstream.record_success(rtt);
            target.upstream.end_probe();
            info!(upstream = %address, "Upstream restored");
            None
        }
        Ok(Ok(_)) => {
            debug!(upstream = %address, "Probe got SERVFAIL");
            Some(target)
        }
        Ok(Err(e)) => {
            debug!(upstream = %address, error = %e, "Probe failed");
            Some(target)
        }
        Err(_) => {
            debug!(upstream = %address, "Probe timed out");
            Some(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UNHEALTHY_AFTER_FAILURES;
    use crate::{ResolverError, Result};
    use async_trait::async_trait;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use kestrel_core::message::make_response;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Flaky {
        up: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn query(
            &self,
            _server: SocketAddr,
            _source: Option<IpAddr>,
            request: &Message,
        ) -> Result<(Message, Duration)> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok((make_response(request), Duration::from_millis(4)))
            } else {
                Err(ResolverError::Timeout)
            }
        }
    }

    fn request() -> Message {
        let mut msg = Message::new();
        msg.add_query(Query::query(Name::from_str("db.corp.example.").unwrap(), RecordType::A));
        msg
    }

    fn down_upstream() -> Arc<Upstream> {
        let upstream = Arc::new(Upstream::new("192.0.2.1:53".parse().unwrap()));
        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            upstream.record_failure();
        }
        upstream
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_upstream_is_restored() {
        let transport = Arc::new(Flaky {
            up: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        });
        let prober = Prober::spawn(transport.clone(), Duration::from_secs(5), Duration::from_secs(1));
        let upstream = down_upstream();

        assert!(prober.add(Arc::clone(&upstream), None, &request()));
        assert!(!prober.add(Arc::clone(&upstream), None, &request()));
        assert_eq!(prober.pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.probes.load(Ordering::SeqCst), 1);
        assert!(!upstream.is_healthy());
        assert_eq!(prober.pending(), 1);

        transport.up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.probes.load(Ordering::SeqCst), 2);
        assert!(upstream.is_healthy());
        assert_eq!(prober.pending(), 0);

        // Restored upstreams can be queued again.
        assert!(prober.add(upstream, None, &request()));
        prober.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_upstreams_are_checked_in_batches() {
        let transport = Arc::new(Flaky {
            up: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        });
        let prober = Prober::spawn(transport.clone(), Duration::from_secs(5), Duration::from_secs(1));
        for _ in 0..PROBE_BATCH + 2 {
            prober.add(down_upstream(), None, &request());
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.probes.load(Ordering::SeqCst), PROBE_BATCH);
        assert_eq!(prober.pending(), PROBE_BATCH + 2);
        prober.shutdown().await;
    }
}
