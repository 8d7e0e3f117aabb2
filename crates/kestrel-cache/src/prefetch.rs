//! Background refresh of cache entries that are about to expire.

use kestrel_core::{Client, QueryHandler, QueryKey};
use kestrel_metrics::metrics;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::message_cache::MessageCache;

/// Capacity of the prefetch task queue.
pub const PREFETCH_QUEUE_SIZE: usize = 1024;

/// Prefetch queue and its worker.
pub struct Prefetcher {
    sender: mpsc::Sender<Client>,
    in_flight: Arc<Mutex<HashSet<QueryKey>>>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Prefetcher {
    /// Starts a worker that re-issues tasks through `handler` and stores the
    /// answers in `cache`.
    pub fn spawn(handler: Arc<dyn QueryHandler>, cache: Weak<MessageCache>) -> Self {
        let (sender, receiver) = mpsc::channel(PREFETCH_QUEUE_SIZE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let worker = tokio::spawn(prefetch_worker(
            receiver,
            shutdown_rx,
            in_flight.clone(),
            handler,
            cache,
        ));

        Self {
            sender,
            in_flight,
            shutdown,
            worker,
        }
    }

    /// Queues a refresh for the client's question. Never blocks; returns
    /// false if the question is already queued or the queue is full.
    pub fn submit(&self, client: &Client) -> bool {
        let key = client.query_key();
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&key) {
            return false;
        }

        match self.sender.try_send(client.clone()) {
            Ok(()) => {
                in_flight.insert(key);
                metrics().record_prefetch();
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    name = %client.question().name(),
                    view = %client.view,
                    "prefetch queue is full, dropping task"
                );
                metrics().record_prefetch_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Returns the number of queued or running tasks.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Stops the worker without draining the queue and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "prefetch worker ended abnormally");
        }
    }
}

async fn prefetch_worker(
    mut receiver: mpsc::Receiver<Client>,
    mut shutdown: watch::Receiver<bool>,
    in_flight: Arc<Mutex<HashSet<QueryKey>>>,
    handler: Arc<dyn QueryHandler>,
    cache: Weak<MessageCache>,
) {
    loop {
        let mut client = tokio::select! {
            _ = shutdown.changed() => break,
            task = receiver.recv() => match task {
                Some(client) => client,
                None => break,
            },
        };

        let key = client.query_key();
        client.response = None;
        client.cache_answer = false;
        client.cache_hit = false;
        handler.handle_query(&mut client).await;

        if client.cache_answer {
            if let Some(mut response) = client.response.take() {
                match cache.upgrade() {
                    Some(cache) => {
                        debug!(name = %client.question().name(), "prefetched answer stored");
                        cache.add(&mut response);
                    }
                    None => break,
                }
            }
        }
        in_flight.lock().remove(&key);
    }
}
