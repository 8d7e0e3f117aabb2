//! Iterative recursive resolution.
//!
//! Each query walks down the delegation tree starting from the closest zone
//! the NSAS knows about (or the root servers), racing up to
//! [`BATCH_QUERY_COUNT`] nameservers per round. Referrals are recorded in the
//! NSAS; nameservers that arrive without glue are resolved by background
//! sub-queries that share the parent's budget.

use crate::nsas::{NameServer, NsasCache, TrustLevel};
use crate::query_source::QuerySourceManager;
use crate::{ResolverError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RData, RecordType};
use kestrel_core::message::rrset_count;
use kestrel_core::{classify_response, Client, Resolver, ResponseCategory};
use kestrel_metrics::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

pub mod ctx;
pub mod root_hint;
pub mod transport;

use ctx::{CtxGuard, CtxPool, RecursorCtx};
use root_hint::{builtin_root_servers, load_root_hint_file};
use transport::Transport;

/// Query rounds allowed per resolution.
pub const MAX_QUERY_DEPTH: u32 = 20;

/// Resolutions (including glue sub-queries) allowed in flight.
pub const MAX_INFLIGHT_QUERIES: usize = 100;

/// Budget for one round of nameserver queries.
pub const SINGLE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Budget for a whole resolution.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Nameservers raced per round.
pub const BATCH_QUERY_COUNT: usize = 3;

/// Interval of the NSAS memory check.
pub const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Advertised EDNS payload size.
pub const EDNS_PAYLOAD: u16 = 4096;

const EDNS_CLIENT_SUBNET: u16 = 8;

/// Recursion settings of one view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecursorViewConfig {
    pub enable: bool,
    pub edns_subnet_enable: bool,
    /// Root hint file; the built-in root servers are used when unset.
    pub root_hint_file: Option<PathBuf>,
}

/// Recursion settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecursorConfig {
    pub views: HashMap<String, RecursorViewConfig>,
    /// NSAS zone capacity (0 means the default).
    pub max_zones: usize,
}

/// Loaded settings of one view.
#[derive(Debug, Clone)]
pub struct RecursorView {
    pub enable: bool,
    pub edns_subnet_enable: bool,
    pub root_servers: Vec<NameServer>,
}

/// The shared machinery a resolution (and its sub-resolutions) runs on.
#[derive(Clone)]
struct Engine {
    nsas: Arc<NsasCache>,
    pool: Arc<CtxPool>,
    transport: Arc<dyn Transport>,
}

impl Engine {
    /// Resolves `ctx.question`, optionally continuing from a referral.
    fn handle_query(
        &self,
        mut ctx: CtxGuard,
        referral: Option<Message>,
    ) -> BoxFuture<'static, Result<Message>> {
        let engine = self.clone();
        async move { engine.run(&mut ctx, referral).await }.boxed()
    }

    async fn run(&self, ctx: &mut RecursorCtx, referral: Option<Message>) -> Result<Message> {
        // A referral handed over by an earlier stage is trusted as if it came
        // from the root.
        let mut pending = referral.map(|response| (Name::root(), response));

        loop {
            let (zone, mut response) = match pending.take() {
                Some(pending) => pending,
                None => match self.query_round(ctx).await? {
                    Some(answered) => answered,
                    None => continue,
                },
            };

            match classify_response(&response) {
                ResponseCategory::Answer | ResponseCategory::NxDomain | ResponseCategory::NxRrset => {
                    if let Err(e) = self.nsas.add_zone_name_server(&zone, &response) {
                        trace!(zone = %zone, error = %e, "No delegation in final answer");
                    }
                    response.take_queries();
                    response.add_query(ctx.question.clone());
                    return Ok(response);
                }
                ResponseCategory::Referral => {
                    let servers = match self.nsas.add_zone_name_server(&zone, &response) {
                        Ok(servers) => servers,
                        Err(e) => {
                            debug!(zone = %zone, error = %e, "Unusable referral");
                            Default::default()
                        }
                    };
                    if !servers.missing.is_empty() {
                        self.get_missing_nameservers(ctx, servers.missing, servers.known.is_empty())
                            .await;
                    }
                }
                ResponseCategory::Invalid => return Err(ResolverError::InvalidResponse),
            }
        }
    }

    /// Sends one round of queries. `Ok(None)` means the round failed and
    /// should be retried.
    async fn query_round(&self, ctx: &mut RecursorCtx) -> Result<Option<(Name, Message)>> {
        ctx.depth += 1;
        if ctx.depth >= MAX_QUERY_DEPTH
            || (ctx.depth > 1 && ctx.start_time.elapsed() > QUERY_TIMEOUT)
        {
            return Err(ResolverError::TooDeepQuery);
        }

        let servers = self
            .nsas
            .select_name_servers(ctx.question.name())
            .unwrap_or_else(|| ctx.root_servers.clone());
        let Some(zone) = servers.first().map(|s| s.zone.clone()) else {
            return Err(ResolverError::AllServersFailed);
        };

        let request = build_request(ctx);
        match self.do_query(ctx.query_source, servers, request).await {
            Ok(response) => Ok(Some((zone, response))),
            Err(e) => {
                debug!(question = %ctx.question.name(), zone = %zone, error = %e, "Query round failed");
                Ok(None)
            }
        }
    }

    async fn do_query(
        &self,
        source: Option<IpAddr>,
        mut servers: Vec<NameServer>,
        request: Message,
    ) -> Result<Message> {
        if servers.len() == 1 {
            return self.do_single_query(source, &servers[0], &request).await;
        }

        servers.sort_by_key(|s| s.rtt);
        servers.truncate(BATCH_QUERY_COUNT);

        let (tx, mut rx) = mpsc::channel(servers.len());
        let request = Arc::new(request);
        for server in servers {
            let engine = self.clone();
            let tx = tx.clone();
            let request = Arc::clone(&request);
            tokio::spawn(async move {
                if let Ok(response) = engine.do_single_query(source, &server, &request).await {
                    let _ = tx.send((server, response)).await;
                }
            });
        }
        drop(tx);

        match timeout(SINGLE_QUERY_TIMEOUT, rx.recv()).await {
            Ok(Some((server, response))) => {
                trace!(%server, rcode = ?response.response_code(), "Got response");
                Ok(response)
            }
            Ok(None) => Err(ResolverError::AllServersFailed),
            Err(_) => Err(ResolverError::QueryTimeout),
        }
    }

    async fn do_single_query(
        &self,
        source: Option<IpAddr>,
        server: &NameServer,
        request: &Message,
    ) -> Result<Message> {
        let upstream = server.addr.to_string();
        metrics().record_upstream_query(&upstream);
        debug!(%server, question = ?request.queries().first(), "Sending query");

        let mut result = self.transport.query(server.addr, source, request).await;
        if matches!(&result, Ok((response, _)) if response.response_code() == ResponseCode::FormErr)
        {
            let mut plain = request.clone();
            *plain.extensions_mut() = None;
            result = self.transport.query(server.addr, source, &plain).await;
        }

        let (result, rtt) = match result {
            Ok((response, rtt)) if is_valid_response(&response) => (Ok(response), rtt),
            Ok((response, _)) => {
                debug!(%server, rcode = ?response.response_code(), "Nameserver returned an error");
                metrics().record_upstream_failure(&upstream, "rcode");
                (Err(ResolverError::DumbNameServer), QUERY_TIMEOUT)
            }
            Err(e) => {
                warn!(%server, error = %e, "Query to nameserver failed");
                metrics().record_upstream_failure(&upstream, "transport");
                let rtt = failure_rtt(&e);
                (Err(e), rtt)
            }
        };

        metrics().record_upstream_latency(&upstream, rtt);
        if let Err(e) = self.nsas.update_rtt(server, rtt) {
            // Root servers are not in the NSAS.
            trace!(%server, error = %e, "RTT not recorded");
        }
        result
    }

    /// Resolves the addresses of nameservers that came without glue.
    async fn get_missing_nameservers(&self, ctx: &RecursorCtx, names: Vec<Name>, wait: bool) {
        if ctx.depth > MAX_QUERY_DEPTH {
            return;
        }

        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut spawned = 0;
        for name in names {
            let Some(mut sub) = self.pool.acquire() else {
                error!(nameserver = %name, "Too many recursive queries in flight");
                continue;
            };
            sub.init(
                ctx.query_source,
                ctx.client_subnet,
                Query::query(name.clone(), RecordType::A),
                ctx.root_servers.clone(),
            );
            sub.depth = ctx.depth;

            let engine = self.clone();
            let done = done_tx.clone();
            spawned += 1;
            tokio::spawn(async move {
                let response = match engine.handle_query(sub, None).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(nameserver = %name, error = %e, "Nameserver address lookup failed");
                        return;
                    }
                };
                let Some((ttl, addrs)) = glue_from_answer(&response, &name) else {
                    return;
                };
                if engine
                    .nsas
                    .add_name_server(name, ttl, addrs, TrustLevel::FromAuth)
                    .is_ok()
                {
                    let _ = done.try_send(());
                }
            });
        }
        drop(done_tx);

        if wait && spawned > 0 {
            let _ = timeout(SINGLE_QUERY_TIMEOUT, done_rx.recv()).await;
        }
    }
}

fn is_valid_response(msg: &Message) -> bool {
    matches!(msg.response_code(), ResponseCode::NoError | ResponseCode::NXDomain)
}

/// The A rrset answering `name` directly (no aliases).
fn glue_from_answer(msg: &Message, name: &Name) -> Option<(Duration, Vec<SocketAddr>)> {
    let answers = msg.answers();
    let first = answers.first()?;
    if rrset_count(answers) != 1 || first.record_type() != RecordType::A || first.name() != name {
        return None;
    }

    let addrs: Vec<SocketAddr> = answers
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(SocketAddr::new(IpAddr::V4(a.0), 53)),
            _ => None,
        })
        .collect();
    let ttl = answers.iter().map(|r| r.ttl()).min().unwrap_or(0);
    (!addrs.is_empty()).then(|| (Duration::from_secs(u64::from(ttl)), addrs))
}

fn build_request(ctx: &RecursorCtx) -> Message {
    let mut request = Message::new();
    request
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    request.add_query(ctx.question.clone());

    let mut edns = Edns::new();
    edns.set_max_payload(EDNS_PAYLOAD);
    if let Some(ip) = ctx.client_subnet {
        edns.set_option(client_subnet_option(ip));
    }
    request.set_edns(edns);
    request
}

/// EDNS client-subnet option announcing the client's /24 (or /56).
fn client_subnet_option(ip: IpAddr) -> EdnsOption {
    let (family, prefix, octets): (u16, u8, Vec<u8>) = match ip {
        IpAddr::V4(v4) => (1, 24, v4.octets()[..3].to_vec()),
        IpAddr::V6(v6) => (2, 56, v6.octets()[..7].to_vec()),
    };
    let mut data = Vec::with_capacity(4 + octets.len());
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(0);
    data.extend_from_slice(&octets);
    EdnsOption::Unknown(EDNS_CLIENT_SUBNET, data)
}

struct State {
    views: HashMap<String, RecursorView>,
    engine: Engine,
}

/// The recursive resolver stage.
pub struct Recursor {
    state: ArcSwap<State>,
    pool: Arc<CtxPool>,
    transport: Arc<dyn Transport>,
    query_source: Arc<QuerySourceManager>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Recursor {
    /// Creates the recursor and starts its memory ticker. Must be called
    /// within a Tokio runtime.
    pub fn new(
        config: RecursorConfig,
        query_source: Arc<QuerySourceManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let views = Self::load_views(&config)?;
        let pool = CtxPool::new(MAX_INFLIGHT_QUERIES);
        let engine = Engine {
            nsas: Arc::new(NsasCache::new(config.max_zones)),
            pool: Arc::clone(&pool),
            transport: Arc::clone(&transport),
        };
        let ticker = spawn_memory_ticker(Arc::clone(&engine.nsas));

        Ok(Self {
            state: ArcSwap::from_pointee(State { views, engine }),
            pool,
            transport,
            query_source,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Loads per-view settings, reading root hint files.
    pub fn load_views(config: &RecursorConfig) -> Result<HashMap<String, RecursorView>> {
        let builtin = builtin_root_servers();
        config
            .views
            .iter()
            .map(|(view, c)| {
                let root_servers = match &c.root_hint_file {
                    Some(path) => load_root_hint_file(path)?,
                    None => builtin.clone(),
                };
                Ok((
                    view.clone(),
                    RecursorView {
                        enable: c.enable,
                        edns_subnet_enable: c.edns_subnet_enable,
                        root_servers,
                    },
                ))
            })
            .collect()
    }

    /// Reloads settings: the ticker is restarted and the NSAS rebuilt.
    pub async fn reload_config(&self, config: RecursorConfig) -> Result<()> {
        let views = Self::load_views(&config)?;
        self.swap_views(views, config.max_zones).await;
        Ok(())
    }

    pub(crate) async fn swap_views(&self, views: HashMap<String, RecursorView>, max_zones: usize) {
        self.stop_ticker().await;

        let engine = Engine {
            nsas: Arc::new(NsasCache::new(max_zones)),
            pool: Arc::clone(&self.pool),
            transport: Arc::clone(&self.transport),
        };
        let ticker = spawn_memory_ticker(Arc::clone(&engine.nsas));
        self.state.store(Arc::new(State { views, engine }));
        *self.ticker.lock() = Some(ticker);

        info!("Recursor configuration reloaded");
    }

    /// Stops the memory ticker.
    pub async fn close(&self) {
        self.stop_ticker().await;
    }

    /// The current nameserver address store.
    pub fn nsas(&self) -> Arc<NsasCache> {
        Arc::clone(&self.state.load().engine.nsas)
    }

    async fn stop_ticker(&self) {
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Recursor {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

fn spawn_memory_ticker(nsas: Arc<NsasCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + MEMORY_CHECK_INTERVAL, MEMORY_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            nsas.enforce_memory_limit();
        }
    })
}

/// RTT charged to a server whose query failed. A server that answered with
/// something unusable costs as much as one that never answered.
fn failure_rtt(e: &ResolverError) -> Duration {
    match e {
        ResolverError::Timeout | ResolverError::QueryTimeout | ResolverError::Network(_) => {
            SINGLE_QUERY_TIMEOUT
        }
        _ => QUERY_TIMEOUT,
    }
}

#[async_trait]
impl Resolver for Recursor {
    async fn resolve(&self, client: &mut Client) {
        let state = self.state.load_full();
        let Some(view) = state.views.get(&client.view).filter(|v| v.enable) else {
            return;
        };

        let Some(mut ctx) = state.engine.pool.acquire() else {
            error!(question = %client.question().name(), "Too many recursive queries in flight");
            return;
        };
        ctx.init(
            self.query_source.query_source(&client.view),
            view.edns_subnet_enable.then(|| client.ip()),
            client.question().clone(),
            view.root_servers.clone(),
        );
        let start = ctx.start_time;

        let referral = client
            .response
            .as_ref()
            .filter(|r| classify_response(r) == ResponseCategory::Referral)
            .cloned();

        match state.engine.handle_query(ctx, referral).await {
            Ok(mut response) => {
                response.set_id(client.id());
                response.set_recursion_available(true);
                debug!(
                    question = %client.question().name(),
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Recursion succeeded"
                );
                metrics().record_recursion(true);
                client.response = Some(response);
                client.cache_answer = true;
            }
            Err(e) => {
                error!(question = %client.question().name(), error = %e, "Recursion failed");
                metrics().record_recursion(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::Record;
    use kestrel_core::message::make_response;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Handler = dyn Fn(SocketAddr, &Message) -> Option<Message> + Send + Sync;

    /// Answers from a closure; `None` simulates a timeout.
    struct ScriptedTransport {
        handler: Box<Handler>,
        sent: Mutex<Vec<(SocketAddr, Message)>>,
    }

    impl ScriptedTransport {
        fn new(handler: impl Fn(SocketAddr, &Message) -> Option<Message> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_to(&self, addr: SocketAddr) -> usize {
            self.sent.lock().iter().filter(|(a, _)| *a == addr).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn query(
            &self,
            server: SocketAddr,
            _source: Option<IpAddr>,
            request: &Message,
        ) -> Result<(Message, Duration)> {
            self.sent.lock().push((server, request.clone()));
            match (self.handler)(server, request) {
                Some(mut response) => {
                    response.set_id(request.id());
                    Ok((response, Duration::from_millis(5)))
                }
                None => Err(ResolverError::Timeout),
            }
        }
    }

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn qname(msg: &Message) -> Name {
        msg.queries()[0].name().clone()
    }

    fn referral(request: &Message, zone: &str, ns: &str, glue: Option<[u8; 4]>) -> Message {
        let mut response = make_response(request);
        response.add_name_server(Record::from_rdata(name(zone), 172800, RData::NS(NS(name(ns)))));
        if let Some(ip) = glue {
            response.add_additional(Record::from_rdata(
                name(ns),
                172800,
                RData::A(A(Ipv4Addr::from(ip))),
            ));
        }
        response
    }

    fn answer(request: &Message, ip: [u8; 4]) -> Message {
        let mut response = make_response(request);
        response.set_authoritative(true);
        response.add_answer(Record::from_rdata(
            qname(request),
            300,
            RData::A(A(Ipv4Addr::from(ip))),
        ));
        response
    }

    fn is_root(server: SocketAddr) -> bool {
        builtin_root_servers().iter().any(|r| r.addr == server)
    }

    /// root → com. (glued) → example.com. (glued) → answer.
    fn delegation_script(server: SocketAddr, request: &Message) -> Option<Message> {
        match server {
            s if is_root(s) => Some(referral(request, "com.", "a.gtld.com.", Some([192, 0, 2, 10]))),
            s if s == addr("192.0.2.10:53") => Some(referral(
                request,
                "example.com.",
                "ns1.example.com.",
                Some([192, 0, 2, 20]),
            )),
            s if s == addr("192.0.2.20:53") => Some(answer(request, [203, 0, 113, 7])),
            _ => None,
        }
    }

    fn config(edns_subnet_enable: bool) -> RecursorConfig {
        RecursorConfig {
            views: HashMap::from([(
                "default".to_string(),
                RecursorViewConfig {
                    enable: true,
                    edns_subnet_enable,
                    root_hint_file: None,
                },
            )]),
            max_zones: 0,
        }
    }

    fn recursor(config: RecursorConfig, transport: Arc<ScriptedTransport>) -> Recursor {
        Recursor::new(config, Arc::new(QuerySourceManager::default()), transport).unwrap()
    }

    fn client(qname: &str, view: &str) -> Client {
        let mut request = Message::new();
        request.set_id(999).set_recursion_desired(true);
        request.add_query(Query::query(name(qname), RecordType::A));
        Client::new(request, addr("198.51.100.9:4000"), view).unwrap()
    }

    #[tokio::test]
    async fn test_walks_delegations() {
        let transport = ScriptedTransport::new(delegation_script);
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;

        let response = client.response.expect("answer");
        assert_eq!(response.id(), 999);
        assert!(response.recursion_available());
        assert_eq!(response.queries()[0].name(), &name("www.example.com."));
        assert_eq!(response.answers()[0].data().unwrap().to_string(), "203.0.113.7");
        assert!(client.cache_answer);

        // The delegation is remembered: a second query goes straight to the
        // example.com. server.
        let nsas = recursor.nsas();
        assert_eq!(nsas.zone_count(), 2);
        let roots_before: usize = builtin_root_servers().iter().map(|r| transport.sent_to(r.addr)).sum();

        let mut again = self::client("mail.example.com.", "default");
        recursor.resolve(&mut again).await;
        assert!(again.response.is_some());
        let roots_after: usize = builtin_root_servers().iter().map(|r| transport.sent_to(r.addr)).sum();
        assert_eq!(roots_before, roots_after);
        recursor.close().await;
    }

    #[tokio::test]
    async fn test_resolves_missing_glue() {
        let transport = ScriptedTransport::new(|server, request| {
            let q = qname(request);
            match server {
                s if is_root(s) && q == name("ns.glue.net.") => Some(referral(
                    request,
                    "glue.net.",
                    "a.glue-servers.net.",
                    Some([192, 0, 2, 30]),
                )),
                s if is_root(s) => Some(referral(request, "example.org.", "ns.glue.net.", None)),
                s if s == addr("192.0.2.30:53") && q == name("ns.glue.net.") => {
                    Some(answer(request, [192, 0, 2, 40]))
                }
                s if s == addr("192.0.2.40:53") => Some(answer(request, [203, 0, 113, 8])),
                _ => None,
            }
        });
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.org.", "default");
        recursor.resolve(&mut client).await;

        let response = client.response.expect("answer");
        assert_eq!(response.answers()[0].data().unwrap().to_string(), "203.0.113.8");
        let ns = recursor.nsas().name_server(&name("ns.glue.net.")).unwrap();
        assert_eq!(ns.trust(), TrustLevel::FromAuth);
        assert_eq!(ns.addrs()[0].addr(), addr("192.0.2.40:53"));
    }

    #[tokio::test]
    async fn test_disabled_view_is_skipped() {
        let transport = ScriptedTransport::new(delegation_script);
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "office");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_none());
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_servers_exhaust_depth() {
        let transport = ScriptedTransport::new(|_, request| {
            let mut response = make_response(request);
            response.set_response_code(ResponseCode::ServFail);
            Some(response)
        });
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_none());
        // Every round races three root servers.
        assert_eq!(
            transport.sent.lock().len(),
            (MAX_QUERY_DEPTH as usize - 1) * BATCH_QUERY_COUNT
        );
    }

    #[tokio::test]
    async fn test_formerr_retries_without_edns() {
        let transport = ScriptedTransport::new(|server, request| {
            if request.extensions().is_some() {
                let mut response = make_response(request);
                response.set_response_code(ResponseCode::FormErr);
                return Some(response);
            }
            delegation_script(server, request)
        });
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_some());
        assert!(transport.sent.lock().iter().any(|(_, m)| m.extensions().is_none()));
    }

    #[tokio::test]
    async fn test_client_subnet_and_no_recursion_desired() {
        let transport = ScriptedTransport::new(delegation_script);
        let recursor = recursor(config(true), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_some());

        let sent = transport.sent.lock();
        let (_, first) = &sent[0];
        assert!(!first.recursion_desired());
        let edns = first.extensions().as_ref().unwrap();
        assert_eq!(edns.max_payload(), EDNS_PAYLOAD);
        match edns.option(hickory_proto::rr::rdata::opt::EdnsCode::Subnet) {
            Some(EdnsOption::Unknown(8, data)) => assert_eq!(data, &vec![0, 1, 24, 0, 198, 51, 100]),
            other => panic!("unexpected subnet option {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_follows_client_referral() {
        let transport = ScriptedTransport::new(delegation_script);
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        client.response = Some(referral(
            &client.request,
            "example.com.",
            "ns1.example.com.",
            Some([192, 0, 2, 20]),
        ));
        recursor.resolve(&mut client).await;

        let response = client.response.expect("answer");
        assert_eq!(response.answers().len(), 1);
        assert!(builtin_root_servers().iter().all(|r| transport.sent_to(r.addr) == 0));
    }

    /// Serves `delegation_script`, except that one server sends garbage.
    struct GarbledServer {
        garbled: SocketAddr,
    }

    #[async_trait]
    impl Transport for GarbledServer {
        async fn query(
            &self,
            server: SocketAddr,
            _source: Option<IpAddr>,
            request: &Message,
        ) -> Result<(Message, Duration)> {
            if server == self.garbled {
                return Err(ResolverError::Protocol("Response ID mismatch".into()));
            }
            match delegation_script(server, request) {
                Some(mut response) => {
                    response.set_id(request.id());
                    Ok((response, Duration::from_millis(5)))
                }
                None => Err(ResolverError::Timeout),
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_response_costs_max_timeout() {
        let garbled = addr("192.0.2.20:53");
        let recursor = Recursor::new(
            config(false),
            Arc::new(QuerySourceManager::default()),
            Arc::new(GarbledServer { garbled }),
        )
        .unwrap();

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_none());

        let ns = recursor.nsas().name_server(&name("ns1.example.com.")).unwrap();
        assert!(ns.addrs()[0].rtt() > SINGLE_QUERY_TIMEOUT);

        assert_eq!(failure_rtt(&ResolverError::Timeout), SINGLE_QUERY_TIMEOUT);
        assert_eq!(failure_rtt(&ResolverError::InvalidResponse), QUERY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_failed_recursion_keeps_client_referral() {
        let transport = ScriptedTransport::new(|_, _| None);
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        client.response = Some(referral(
            &client.request,
            "example.com.",
            "ns1.example.com.",
            Some([192, 0, 2, 20]),
        ));
        recursor.resolve(&mut client).await;

        let response = client.response.expect("referral kept");
        assert_eq!(classify_response(&response), ResponseCategory::Referral);
        assert!(!client.cache_answer);
        assert!(transport.sent_to(addr("192.0.2.20:53")) > 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_fails_query() {
        let transport = ScriptedTransport::new(delegation_script);
        let recursor = recursor(config(false), Arc::clone(&transport));

        let held: Vec<CtxGuard> = (0..MAX_INFLIGHT_QUERIES)
            .map(|_| recursor.pool.acquire().unwrap())
            .collect();
        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert!(client.response.is_none());
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ticker_restarts_on_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport = ScriptedTransport::new(move |server, request| {
            counter.fetch_add(1, Ordering::Relaxed);
            delegation_script(server, request)
        });
        let recursor = recursor(config(false), Arc::clone(&transport));

        let mut client = client("www.example.com.", "default");
        recursor.resolve(&mut client).await;
        assert_eq!(recursor.nsas().zone_count(), 2);

        recursor.reload_config(config(false)).await.unwrap();
        assert_eq!(recursor.nsas().zone_count(), 0);
        assert!(calls.load(Ordering::Relaxed) > 0);

        tokio::time::advance(MEMORY_CHECK_INTERVAL * 2).await;
        recursor.close().await;
        assert!(recursor.ticker.lock().is_none());
    }
}
