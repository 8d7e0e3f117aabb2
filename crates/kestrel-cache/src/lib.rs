//! # Kestrel DNS Cache
//!
//! Response caching for the Kestrel resolver pipeline.
//!
//! ## Architecture
//!
//! - **MessageCache**: one per view, an LRU of complete responses keyed by
//!   question name and type, with TTL ceilings for positive and negative
//!   answers
//! - **Prefetcher**: refreshes entries about to expire by re-running the
//!   query through the downstream pipeline
//! - **Cache**: the pipeline stage that answers from the per-view caches and
//!   stores cacheable downstream answers
//!
//! ## Features
//!
//! - Round-robin rotation of multi-record answers on every hit
//! - SOA-minimum negative caching
//! - Administrative commands for inspection and cleanup

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::Message;
use kestrel_core::{Client, QueryHandler, DEFAULT_VIEW};
use kestrel_metrics::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub mod command;
pub mod lru;
pub mod message_cache;
pub mod prefetch;

pub use command::{CacheCommand, CommandError, CommandOutput, RRInCache};
pub use lru::LruList;
pub use message_cache::{CacheEntry, CacheStats, MessageCache};
pub use prefetch::Prefetcher;

/// Default ceiling for positive answers, in seconds.
pub const DEFAULT_POSITIVE_TTL: u32 = 3600;

/// Default ceiling for negative answers, in seconds.
pub const DEFAULT_NEGATIVE_TTL: u32 = 60;

/// Message cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL ceiling for positive answers (seconds).
    pub positive_ttl: u32,

    /// TTL ceiling for negative answers (seconds).
    pub negative_ttl: u32,

    /// Maximum entries per view; 0 means unbounded.
    pub max_cache_size: usize,

    /// Drop authority/additional data from cached answers.
    pub short_answer: bool,

    /// Refresh entries that are about to expire.
    pub prefetch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: DEFAULT_POSITIVE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_cache_size: 0,
            short_answer: false,
            prefetch: false,
        }
    }
}

impl CacheConfig {
    /// Replaces zero TTL ceilings with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.positive_ttl == 0 {
            self.positive_ttl = DEFAULT_POSITIVE_TTL;
        }
        if self.negative_ttl == 0 {
            self.negative_ttl = DEFAULT_NEGATIVE_TTL;
        }
        self
    }
}

/// Cache pipeline stage holding one [`MessageCache`] per view.
pub struct Cache {
    caches: ArcSwap<HashMap<String, Arc<MessageCache>>>,
    next: Arc<dyn QueryHandler>,
}

impl Cache {
    /// Creates caches for `views` plus the default view. `next` is the
    /// handler queried on a miss.
    pub fn new(config: CacheConfig, views: &[String], next: Arc<dyn QueryHandler>) -> Self {
        let config = config.normalized();
        let mut caches = HashMap::new();
        for view in views.iter().map(String::as_str).chain([DEFAULT_VIEW]) {
            caches
                .entry(view.to_string())
                .or_insert_with(|| MessageCache::new(config.clone(), Some(next.clone())));
        }

        Self {
            caches: ArcSwap::from_pointee(caches),
            next,
        }
    }

    /// The cache of a view.
    pub fn view_cache(&self, view: &str) -> Option<Arc<MessageCache>> {
        self.caches.load().get(view).cloned()
    }

    /// Snapshot of every view's cache.
    pub fn caches(&self) -> Arc<HashMap<String, Arc<MessageCache>>> {
        self.caches.load_full()
    }

    /// Stores a response in a view's cache. Unknown views are ignored.
    pub fn add_message(&self, view: &str, mut message: Message) {
        if let Some(cache) = self.view_cache(view) {
            cache.add(&mut message);
        }
    }

    /// Applies new settings. Caches of surviving views keep their entries,
    /// removed views are dropped and new views start empty.
    pub async fn reload_config(&self, config: CacheConfig, views: &[String]) {
        let config = config.normalized();
        let current = self.caches.load_full();
        let mut caches = HashMap::new();

        for view in views.iter().map(String::as_str).chain([DEFAULT_VIEW]) {
            if caches.contains_key(view) {
                continue;
            }
            let cache = match current.get(view) {
                Some(cache) => {
                    cache.reload_config(config.clone()).await;
                    cache.clone()
                }
                None => MessageCache::new(config.clone(), Some(self.next.clone())),
            };
            caches.insert(view.to_string(), cache);
        }

        for (view, cache) in current.iter() {
            if !caches.contains_key(view) {
                cache.close().await;
            }
        }

        info!(views = caches.len(), "message cache reloaded");
        self.caches.store(Arc::new(caches));
    }

    /// Stops every prefetch worker.
    pub async fn close(&self) {
        for cache in self.caches.load_full().values() {
            cache.close().await;
        }
    }
}

#[async_trait]
impl QueryHandler for Cache {
    async fn handle_query(&self, client: &mut Client) {
        let cache = self.view_cache(&client.view);

        if let Some(mut response) = cache.as_ref().and_then(|c| c.get(client)) {
            client.cache_hit = true;
            metrics().record_cache_hit(&client.view);
            debug!(name = %client.question().name(), view = %client.view, "cache hit");

            response.set_id(client.id());
            response.set_authoritative(false);
            response.take_queries();
            response.add_queries(client.request.queries().iter().cloned());
            client.response = Some(response);
            return;
        }

        client.cache_hit = false;
        metrics().record_cache_miss(&client.view);
        self.next.handle_query(client).await;

        if client.cache_answer {
            if let (Some(cache), Some(response)) = (cache, client.response.as_mut()) {
                cache.add(response);
                metrics().set_cache_size(&client.view, cache.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use kestrel_core::message::make_response;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Upstream {
        calls: AtomicUsize,
        cacheable: bool,
        ttl: u32,
    }

    #[async_trait]
    impl QueryHandler for Upstream {
        async fn handle_query(&self, client: &mut Client) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut resp = make_response(&client.request);
            resp.set_authoritative(true);
            resp.add_answer(Record::from_rdata(
                client.question().name().clone(),
                self.ttl,
                RData::A(A::new(192, 0, 2, 1)),
            ));
            resp.add_name_server(Record::from_rdata(
                Name::from_str("example.com.").unwrap(),
                self.ttl,
                RData::NS(NS(Name::from_str("ns.example.com.").unwrap())),
            ));
            client.response = Some(resp);
            client.cache_answer = self.cacheable;
        }
    }

    fn client(id: u16, qname: &str, view: &str) -> Client {
        let mut msg = Message::new();
        msg.set_id(id).set_message_type(MessageType::Query);
        msg.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
        Client::new(msg, "192.0.2.53:40000".parse().unwrap(), view).unwrap()
    }

    fn upstream(cacheable: bool) -> Arc<Upstream> {
        Arc::new(Upstream {
            calls: AtomicUsize::new(0),
            cacheable,
            ttl: 300,
        })
    }

    #[tokio::test]
    async fn test_miss_returns_clamped_response() {
        let next = Arc::new(Upstream {
            calls: AtomicUsize::new(0),
            cacheable: true,
            ttl: 86400,
        });
        let config = CacheConfig {
            short_answer: true,
            ..CacheConfig::default()
        };
        let cache = Cache::new(config, &[], next);

        let mut first = client(1, "www.example.com.", "default");
        cache.handle_query(&mut first).await;
        assert!(!first.cache_hit);
        let miss = first.response.unwrap();
        assert_eq!(miss.answers()[0].ttl(), DEFAULT_POSITIVE_TTL);
        assert!(miss.name_servers().is_empty());
        assert!(miss.recursion_available());

        let mut second = client(2, "www.example.com.", "default");
        cache.handle_query(&mut second).await;
        assert!(second.cache_hit);
        let hit = second.response.unwrap();
        assert_eq!(hit.answers(), miss.answers());
        assert_eq!(hit.name_servers(), miss.name_servers());
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let next = upstream(true);
        let cache = Cache::new(CacheConfig::default(), &[], next.clone());

        let mut first = client(1, "www.example.com.", "default");
        cache.handle_query(&mut first).await;
        assert!(!first.cache_hit);
        assert_eq!(next.calls.load(Ordering::SeqCst), 1);

        let mut second = client(2, "WWW.example.com.", "default");
        cache.handle_query(&mut second).await;
        assert!(second.cache_hit);
        assert_eq!(next.calls.load(Ordering::SeqCst), 1);

        let response = second.response.unwrap();
        assert_eq!(response.id(), 2);
        assert!(!response.authoritative());
        assert!(response.recursion_available());
        assert_eq!(response.queries()[0].name().to_string(), "WWW.example.com.");
    }

    #[tokio::test]
    async fn test_uncacheable_answers_are_not_stored() {
        let next = upstream(false);
        let cache = Cache::new(CacheConfig::default(), &[], next.clone());

        for id in 0..2 {
            let mut client = client(id, "www.example.com.", "default");
            cache.handle_query(&mut client).await;
            assert!(!client.cache_hit);
        }
        assert_eq!(next.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_views_are_isolated() {
        let next = upstream(true);
        let cache = Cache::new(CacheConfig::default(), &["office".to_string()], next.clone());

        let mut a = client(1, "www.example.com.", "office");
        cache.handle_query(&mut a).await;
        let mut b = client(2, "www.example.com.", "default");
        cache.handle_query(&mut b).await;
        assert!(!b.cache_hit);
        assert_eq!(next.calls.load(Ordering::SeqCst), 2);

        // Unknown views bypass the cache.
        let mut c = client(3, "www.example.com.", "lab");
        cache.handle_query(&mut c).await;
        assert!(!c.cache_hit);
        assert!(c.response.is_some());
    }

    #[tokio::test]
    async fn test_reload_keeps_surviving_views() {
        let next = upstream(true);
        let cache = Cache::new(
            CacheConfig::default(),
            &["office".to_string(), "lab".to_string()],
            next.clone(),
        );
        let mut a = client(1, "www.example.com.", "office");
        cache.handle_query(&mut a).await;

        cache
            .reload_config(
                CacheConfig {
                    max_cache_size: 10,
                    ..CacheConfig::default()
                },
                &["office".to_string()],
            )
            .await;

        assert!(cache.view_cache("lab").is_none());
        let office = cache.view_cache("office").unwrap();
        assert_eq!(office.len(), 1);
        assert_eq!(office.config().max_cache_size, 10);
        assert!(cache.view_cache(DEFAULT_VIEW).is_some());
    }
}
