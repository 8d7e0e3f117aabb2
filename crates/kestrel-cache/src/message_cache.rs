//! Per-view message cache.

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, RecordType};
use kestrel_core::message::{name_hash, rotate_answers};
use kestrel_core::{Client, QueryHandler};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::prefetch::Prefetcher;
use super::CacheConfig;

/// Entries expiring within this window are refreshed in the background.
pub const PREFETCH_WINDOW: Duration = Duration::from_secs(10);

/// Cache key: name hash in the high half, type in the low half.
pub fn cache_key(name: &Name, rtype: RecordType) -> u64 {
    (u64::from(name_hash(name)) << 32) | u64::from(u16::from(rtype))
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    message: Message,
    expire_at: Instant,
}

impl CacheEntry {
    /// The cached message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// When the entry stops being served.
    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }

    /// Returns true if the entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at <= now
    }

    /// Returns true if the entry expires within the prefetch window.
    pub fn needs_prefetch(&self, now: Instant) -> bool {
        self.expire_at < now + PREFETCH_WINDOW
    }

    fn is_for(&self, name: &Name) -> bool {
        self.message
            .queries()
            .first()
            .map(|q| q.name() == name)
            .unwrap_or(false)
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct Inner {
    config: CacheConfig,
    entries: super::lru::LruList<u64, CacheEntry>,
}

impl Inner {
    /// Finds a live entry for the exact name, promoting and rotating it.
    fn lookup(&mut self, name: &Name, rtype: RecordType, now: Instant) -> Option<&CacheEntry> {
        let key = cache_key(name, rtype);
        let live = self
            .entries
            .get(&key)
            .map(|entry| !entry.is_expired(now) && entry.is_for(name))
            .unwrap_or(false);
        if !live {
            return None;
        }

        self.entries.touch(&key);
        let entry = self.entries.get_mut(&key)?;
        rotate_answers(&mut entry.message);
        Some(entry)
    }
}

/// LRU + TTL cache of complete responses for one view.
pub struct MessageCache {
    inner: RwLock<Inner>,
    handler: Option<Arc<dyn QueryHandler>>,
    prefetcher: Mutex<Option<Prefetcher>>,
    me: Weak<MessageCache>,
    stats: CacheStats,
}

impl MessageCache {
    /// Creates a cache. `handler` is the pipeline downstream of the cache and
    /// is what prefetch tasks are re-issued through.
    ///
    /// Starting a prefetch worker requires a Tokio runtime.
    pub fn new(config: CacheConfig, handler: Option<Arc<dyn QueryHandler>>) -> Arc<Self> {
        let cache = Arc::new_cyclic(|me| Self {
            inner: RwLock::new(Inner {
                config: CacheConfig::default(),
                entries: super::lru::LruList::new(),
            }),
            handler,
            prefetcher: Mutex::new(None),
            me: me.clone(),
            stats: CacheStats::default(),
        });
        cache.apply_config(config);
        cache
    }

    /// Stores a response. TTL ceilings and short-answer stripping are
    /// applied to `message` itself, so the caller sends what was cached.
    pub fn add(&self, message: &mut Message) {
        let Some(question) = message.queries().first().cloned() else {
            return;
        };
        let key = cache_key(question.name(), question.query_type());

        let mut inner = self.inner.write();
        let entry = build_entry(&inner.config, message);
        inner.entries.insert(key, entry);

        let max_size = inner.config.max_cache_size;
        if max_size != 0 && inner.entries.len() > max_size {
            debug!(
                size = inner.entries.len(),
                max_size, "message cache full, evicting oldest entry"
            );
            inner.entries.pop_back();
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Looks up the client's question. A hit close to expiry schedules a
    /// background refresh.
    pub fn get(&self, client: &Client) -> Option<Message> {
        let question = client.question();
        let now = Instant::now();

        let (message, needs_prefetch) = {
            let mut inner = self.inner.write();
            let prefetch = inner.config.prefetch;
            match inner.lookup(question.name(), question.query_type(), now) {
                Some(entry) => (entry.message.clone(), prefetch && entry.needs_prefetch(now)),
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };
        self.stats.hits.fetch_add(1, Ordering::Relaxed);

        if needs_prefetch {
            if let Some(prefetcher) = self.prefetcher.lock().as_ref() {
                prefetcher.submit(client);
            }
        }
        Some(message)
    }

    /// Looks up a message without scheduling prefetch.
    pub fn get_single_message(&self, name: &Name, rtype: RecordType) -> Option<Message> {
        self.inner
            .write()
            .lookup(name, rtype, Instant::now())
            .map(|entry| entry.message.clone())
    }

    /// Removes the entry for `name`/`rtype` if it is cached under that name.
    pub fn remove(&self, name: &Name, rtype: RecordType) {
        let key = cache_key(name, rtype);
        let mut inner = self.inner.write();
        let matches = inner
            .entries
            .get(&key)
            .map(|entry| entry.is_for(name))
            .unwrap_or(false);
        if matches {
            inner.entries.remove(&key);
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current settings.
    pub fn config(&self) -> CacheConfig {
        self.inner.read().config.clone()
    }

    /// Number of prefetch tasks queued or running.
    pub fn prefetch_in_flight(&self) -> usize {
        self.prefetcher
            .lock()
            .as_ref()
            .map(|p| p.in_flight_count())
            .unwrap_or(0)
    }

    /// Applies new settings. The prefetch worker is stopped and, if prefetch
    /// is still enabled, restarted with a fresh queue.
    pub async fn reload_config(&self, config: CacheConfig) {
        self.stop_prefetcher().await;
        self.apply_config(config);
    }

    /// Stops the prefetch worker. Safe to call more than once.
    pub async fn close(&self) {
        self.stop_prefetcher().await;
    }

    async fn stop_prefetcher(&self) {
        let prefetcher = self.prefetcher.lock().take();
        if let Some(prefetcher) = prefetcher {
            prefetcher.shutdown().await;
        }
    }

    fn apply_config(&self, config: CacheConfig) {
        let prefetch = config.prefetch;
        self.inner.write().config = config;

        if prefetch {
            if let Some(handler) = &self.handler {
                let prefetcher = Prefetcher::spawn(handler.clone(), self.me.clone());
                *self.prefetcher.lock() = Some(prefetcher);
            }
        }
    }
}

fn build_entry(config: &CacheConfig, message: &mut Message) -> CacheEntry {
    message.set_recursion_available(true);

    let ttl = if message.answers().is_empty() {
        negative_ttl(config, message)
    } else {
        positive_ttl(config, message)
    };

    CacheEntry {
        message: message.clone(),
        expire_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
    }
}

fn positive_ttl(config: &CacheConfig, message: &mut Message) -> u32 {
    if config.short_answer {
        message.take_name_servers();
        message.take_additionals();
    }

    let ceiling = config.positive_ttl;
    let mut min_ttl = ceiling;
    let mut answers = message.take_answers();
    for record in answers.iter_mut() {
        let ttl = record.ttl();
        if ttl < min_ttl {
            min_ttl = ttl;
        } else if ttl > ceiling {
            record.set_ttl(ceiling);
        }
    }
    message.insert_answers(answers);
    min_ttl
}

fn negative_ttl(config: &CacheConfig, message: &mut Message) -> u32 {
    let mut min_ttl = config.negative_ttl;

    let mut authority = message.take_name_servers();
    if authority.len() == 1 {
        let minimum = match authority[0].data() {
            Some(RData::SOA(soa)) => Some(soa.minimum()),
            _ => None,
        };
        if let Some(minimum) = minimum {
            min_ttl = min_ttl.min(minimum);
            let soa_ttl = authority[0].ttl();
            if soa_ttl < min_ttl {
                min_ttl = soa_ttl;
            } else {
                authority[0].set_ttl(min_ttl);
            }
        }
    }
    message.insert_name_servers(authority);

    if config.short_answer {
        message.take_additionals();
    }
    min_ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, NS, SOA};
    use hickory_proto::rr::Record;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn build_message(qname: &str, ip: Ipv4Addr, ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_id(1000).set_message_type(MessageType::Response);
        msg.add_query(Query::query(name(qname), RecordType::A));
        msg.add_answer(Record::from_rdata(name(qname), ttl, RData::A(A(ip))));
        msg
    }

    fn client(qname: &str) -> Client {
        let mut msg = Message::new();
        msg.add_query(Query::query(name(qname), RecordType::A));
        Client::new(msg, "127.0.0.1:5353".parse().unwrap(), "default").unwrap()
    }

    fn first_answer(msg: &Message) -> String {
        msg.answers()[0].data().unwrap().to_string()
    }

    fn config(max_cache_size: usize) -> CacheConfig {
        CacheConfig {
            positive_ttl: 60,
            negative_ttl: 60,
            max_cache_size,
            short_answer: true,
            prefetch: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_cache() {
        let cache = MessageCache::new(config(3), None);
        assert_eq!(cache.len(), 0);

        cache.add(&mut build_message("test.example.com.", Ipv4Addr::new(1, 1, 1, 1), 3));
        assert_eq!(cache.len(), 1);

        let client = client("test.example.com.");
        let mut message = cache.get(&client).expect("message should be fetched");
        assert_eq!(message.id(), 1000);
        assert!(message.recursion_available());

        cache.add(&mut message);
        assert_eq!(cache.len(), 1);

        cache.add(&mut build_message("test1.example.com.", Ipv4Addr::new(1, 1, 1, 1), 3));
        assert_eq!(cache.len(), 2);
        cache.add(&mut build_message("test2.example.com.", Ipv4Addr::new(1, 1, 1, 1), 3));
        assert_eq!(cache.len(), 3);
        cache.add(&mut build_message("test3.example.com.", Ipv4Addr::new(1, 1, 1, 1), 3));
        assert_eq!(cache.len(), 3);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.get(&client).is_none(), "message should expire");
        assert_eq!(cache.len(), 3);

        cache.add(&mut build_message("test.example.com.", Ipv4Addr::new(2, 2, 2, 2), 30));
        assert_eq!(cache.len(), 3);
        let message = cache.get(&client).expect("message should not expire");
        assert_eq!(first_answer(&message), "2.2.2.2");

        cache.remove(&name("test.example.com."), RecordType::A);
        assert!(cache.get(&client).is_none(), "message should be removed");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recent() {
        let cache = MessageCache::new(config(2), None);
        cache.add(&mut build_message("a.example.", Ipv4Addr::new(1, 1, 1, 1), 60));
        cache.add(&mut build_message("b.example.", Ipv4Addr::new(1, 1, 1, 1), 60));
        assert!(cache.get(&client("a.example.")).is_some());

        cache.add(&mut build_message("c.example.", Ipv4Addr::new(1, 1, 1, 1), 60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&client("a.example.")).is_some());
        assert!(cache.get(&client("b.example.")).is_none());
        assert!(cache.get(&client("c.example.")).is_some());
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn test_positive_ttl_ceiling() {
        let cache = MessageCache::new(config(0), None);
        let mut msg = build_message("www.example.", Ipv4Addr::new(1, 1, 1, 1), 7200);
        msg.add_answer(Record::from_rdata(
            name("www.example."),
            30,
            RData::A(A::new(2, 2, 2, 2)),
        ));
        msg.add_name_server(Record::from_rdata(
            name("example."),
            3600,
            RData::NS(NS(name("ns.example."))),
        ));
        cache.add(&mut msg);

        let cached = cache
            .get_single_message(&name("www.example."), RecordType::A)
            .unwrap();
        let ttls: Vec<u32> = cached.answers().iter().map(|r| r.ttl()).collect();
        assert!(ttls.contains(&60));
        assert!(ttls.contains(&30));
        assert!(cached.name_servers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_ttl_from_soa() {
        let cache = MessageCache::new(config(0), None);
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NXDomain);
        msg.add_query(Query::query(name("missing.example."), RecordType::A));
        msg.add_name_server(Record::from_rdata(
            name("example."),
            3600,
            RData::SOA(SOA::new(
                name("ns.example."),
                name("admin.example."),
                1,
                3600,
                600,
                86400,
                20,
            )),
        ));
        cache.add(&mut msg);

        let cached = cache
            .get_single_message(&name("missing.example."), RecordType::A)
            .unwrap();
        assert_eq!(cached.name_servers()[0].ttl(), 20);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(cache
            .get_single_message(&name("missing.example."), RecordType::A)
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_checks_name() {
        let cache = MessageCache::new(config(0), None);
        cache.add(&mut build_message("a.example.", Ipv4Addr::new(1, 1, 1, 1), 60));
        cache.remove(&name("b.example."), RecordType::A);
        cache.remove(&name("a.example."), RecordType::AAAA);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_rotates_answers() {
        let cache = MessageCache::new(config(0), None);
        let mut msg = build_message("rr.example.", Ipv4Addr::new(1, 1, 1, 1), 60);
        msg.add_answer(Record::from_rdata(
            name("rr.example."),
            60,
            RData::A(A::new(2, 2, 2, 2)),
        ));
        cache.add(&mut msg);

        let client = client("rr.example.");
        assert_eq!(first_answer(&cache.get(&client).unwrap()), "2.2.2.2");
        assert_eq!(first_answer(&cache.get(&client).unwrap()), "1.1.1.1");
    }

    #[tokio::test]
    async fn test_hash_collision_is_not_a_match() {
        let cache = MessageCache::new(config(0), None);
        let other = name("b.example.");
        let entry = CacheEntry {
            message: build_message("a.example.", Ipv4Addr::new(1, 1, 1, 1), 60),
            expire_at: Instant::now() + Duration::from_secs(60),
        };
        // Same slot as `other`, different question name.
        cache
            .inner
            .write()
            .entries
            .insert(cache_key(&other, RecordType::A), entry);

        assert!(cache.get_single_message(&other, RecordType::A).is_none());
        assert!(cache.get(&client("b.example.")).is_none());
        cache.remove(&other, RecordType::A);
        assert_eq!(cache.len(), 1);
    }
}
