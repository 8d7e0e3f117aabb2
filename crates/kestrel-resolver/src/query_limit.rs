//! Single-flight collapsing of identical outbound resolutions.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_proto::op::Message;
use kestrel_core::{Client, QueryKey, Resolver};
use kestrel_metrics::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

#[derive(Clone)]
struct Outcome {
    response: Option<Message>,
    cache_answer: bool,
}

type Flight = watch::Receiver<Option<Outcome>>;

/// Lets one client (the leader) resolve a question while concurrent clients
/// asking the same thing wait for its answer.
pub struct QueryLimit {
    resolver: Arc<dyn Resolver>,
    inflight: DashMap<QueryKey, Flight>,
    leaders: AtomicUsize,
    max_leaders: AtomicUsize,
}

/// Removes the in-flight entry and releases the leader slot, even if the
/// leader's future is dropped.
struct LeaderGuard<'a> {
    limit: &'a QueryLimit,
    key: QueryKey,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.limit.inflight.remove(&self.key);
        self.limit.leaders.fetch_sub(1, Ordering::AcqRel);
    }
}

fn leader_limit(handler_count: usize) -> usize {
    handler_count * 8 / 10
}

impl QueryLimit {
    /// A `handler_count` of zero disables the leader cap.
    pub fn new(resolver: Arc<dyn Resolver>, handler_count: usize) -> Self {
        Self {
            resolver,
            inflight: DashMap::new(),
            leaders: AtomicUsize::new(0),
            max_leaders: AtomicUsize::new(leader_limit(handler_count)),
        }
    }

    pub fn reload_config(&self, handler_count: usize) {
        self.max_leaders
            .store(leader_limit(handler_count), Ordering::Relaxed);
    }

    /// Number of resolutions currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn try_lead(&self) -> bool {
        let max = self.max_leaders.load(Ordering::Relaxed);
        let current = self.leaders.fetch_add(1, Ordering::AcqRel);
        if max != 0 && current >= max {
            self.leaders.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    async fn lead(&self, client: &mut Client, key: QueryKey, tx: watch::Sender<Option<Outcome>>) {
        let _guard = LeaderGuard { limit: self, key };
        self.resolver.resolve(client).await;
        // Followers may all be gone; that is fine.
        let _ = tx.send(Some(Outcome {
            response: client.response.clone(),
            cache_answer: client.cache_answer,
        }));
    }

    async fn follow(&self, client: &mut Client, mut flight: Flight) {
        let outcome = match flight.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        let Some(outcome) = outcome else {
            debug!(question = %client.question().name(), "Leader vanished, resolving alone");
            self.resolver.resolve(client).await;
            return;
        };

        let same_question = outcome
            .response
            .as_ref()
            .and_then(|r| r.queries().first())
            .map_or(true, |q| q.name() == client.question().name());
        if !same_question {
            debug!(question = %client.question().name(), "Leader answered another question, resolving alone");
            self.resolver.resolve(client).await;
            return;
        }

        client.response = outcome.response.map(|mut response| {
            response.set_id(client.id());
            response
        });
        client.cache_answer = outcome.cache_answer;
    }
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(Flight),
    Dropped,
}

#[async_trait]
impl Resolver for QueryLimit {
    async fn resolve(&self, client: &mut Client) {
        let key = client.query_key();
        let role = match self.inflight.entry(key) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                if self.try_lead() {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Role::Leader(tx)
                } else {
                    Role::Dropped
                }
            }
        };

        match role {
            Role::Leader(tx) => self.lead(client, key, tx).await,
            Role::Follower(flight) => self.follow(client, flight).await,
            Role::Dropped => {
                error!(
                    question = %client.question().name(),
                    view = %client.view,
                    "Too many concurrent resolutions, query dropped"
                );
                metrics().record_query_limited();
            }
        }
    }
}
