//! Forward zones: questions under a configured zone go to its upstreams.
//!
//! A zone matches its subdomains, only its own name, or marks an exception
//! whose names are never forwarded. Upstreams that stop answering are left
//! out until the prober sees them answer again.

use crate::name_tree::NameTree;
use crate::prober::{Prober, DEFAULT_PROBE_INTERVAL};
use crate::query_source::QuerySourceManager;
use crate::recursor::transport::Transport;
use crate::upstream::{Upstream, UpstreamGroup};
use crate::{ResolverError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Name;
use kestrel_core::{Client, Resolver};
use kestrel_metrics::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Which names a forward zone applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ZoneMatch {
    /// The zone and everything below it.
    #[default]
    Subdomain,
    /// The zone name only.
    Exact,
    /// Nothing at or below the zone is forwarded.
    Exception,
}

/// One forward zone.
#[derive(Debug, Clone, Default)]
pub struct ForwardZoneConfig {
    pub zone: String,
    pub servers: Vec<SocketAddr>,
    pub kind: ZoneMatch,
}

/// Forwarder settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Forward zones per view.
    pub views: HashMap<String, Vec<ForwardZoneConfig>>,

    /// Per-upstream query timeout.
    pub timeout: Duration,

    /// Upstreams tried per query.
    pub retries: usize,

    /// Time between probes of down upstreams.
    pub probe_interval: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            views: HashMap::new(),
            timeout: Duration::from_secs(3),
            retries: 3,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// A forward zone as stored in the view tree.
#[derive(Debug)]
pub enum ZoneForwarder {
    Subdomain(Arc<UpstreamGroup>),
    Exact(Arc<UpstreamGroup>),
    Exception,
}

/// Forward zones of one view.
pub type ForwardZones = NameTree<ZoneForwarder>;

/// Upstreams responsible for `name`, if any.
pub fn find_upstreams<'a>(zones: &'a ForwardZones, name: &Name) -> Option<&'a Arc<UpstreamGroup>> {
    for (zone, exact) in zones.find_enclosing(name) {
        match zone {
            ZoneForwarder::Exception => return None,
            ZoneForwarder::Subdomain(group) => return Some(group),
            ZoneForwarder::Exact(group) if exact => return Some(group),
            ZoneForwarder::Exact(_) => {}
        }
    }
    None
}

struct State {
    views: HashMap<String, ForwardZones>,
    timeout: Duration,
    retries: usize,
}

/// Forward resolver that sends queries to upstream servers.
pub struct Forwarder {
    state: ArcSwap<State>,
    query_source: Arc<QuerySourceManager>,
    transport: Arc<dyn Transport>,
    prober: Mutex<Option<Prober>>,
}

impl Forwarder {
    /// Creates the forwarder and starts its prober. Must be called within a
    /// Tokio runtime.
    pub fn new(
        config: ForwarderConfig,
        query_source: Arc<QuerySourceManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let views = Self::load_views(&config)?;
        let prober = Prober::spawn(Arc::clone(&transport), config.probe_interval, config.timeout);
        Ok(Self {
            state: ArcSwap::from_pointee(State {
                views,
                timeout: config.timeout,
                retries: config.retries,
            }),
            query_source,
            transport,
            prober: Mutex::new(Some(prober)),
        })
    }

    /// Builds the per-view zone trees.
    pub fn load_views(config: &ForwarderConfig) -> Result<HashMap<String, ForwardZones>> {
        let mut views = HashMap::new();
        for (view, zones) in &config.views {
            let mut tree = NameTree::new();
            for zone in zones {
                let name = Name::from_str(&zone.zone).map_err(|e| {
                    ResolverError::Protocol(format!("invalid forward zone {}: {e}", zone.zone))
                })?;
                if zone.kind != ZoneMatch::Exception && zone.servers.is_empty() {
                    return Err(ResolverError::NoUpstream);
                }
                let group = || Arc::new(UpstreamGroup::new(&zone.servers));
                let forwarder = match zone.kind {
                    ZoneMatch::Subdomain => ZoneForwarder::Subdomain(group()),
                    ZoneMatch::Exact => ZoneForwarder::Exact(group()),
                    ZoneMatch::Exception => ZoneForwarder::Exception,
                };
                if tree.insert(&name, forwarder).is_some() {
                    return Err(ResolverError::Protocol(format!(
                        "duplicate forward zone {} in view {view}",
                        zone.zone
                    )));
                }
            }
            views.insert(view.clone(), tree);
        }
        Ok(views)
    }

    pub async fn reload_config(&self, config: &ForwarderConfig) -> Result<()> {
        let views = Self::load_views(config)?;
        self.swap_views(views, config).await;
        Ok(())
    }

    /// Installs new zones. Upstreams are rebuilt, so the prober restarts
    /// with an empty queue.
    pub(crate) async fn swap_views(&self, views: HashMap<String, ForwardZones>, config: &ForwarderConfig) {
        self.stop_prober().await;
        self.state.store(Arc::new(State {
            views,
            timeout: config.timeout,
            retries: config.retries,
        }));
        let prober = Prober::spawn(Arc::clone(&self.transport), config.probe_interval, config.timeout);
        *self.prober.lock() = Some(prober);
    }

    /// Stops the prober.
    pub async fn close(&self) {
        self.stop_prober().await;
    }

    /// Number of down upstreams waiting for a probe.
    pub fn probing(&self) -> usize {
        self.prober.lock().as_ref().map(Prober::pending).unwrap_or(0)
    }

    async fn stop_prober(&self) {
        let prober = self.prober.lock().take();
        if let Some(prober) = prober {
            prober.shutdown().await;
        }
    }

    async fn query_upstream(
        &self,
        upstream: &Arc<Upstream>,
        source: Option<IpAddr>,
        request: &Message,
        limit: Duration,
    ) -> Result<Message> {
        let address = upstream.address().to_string();
        metrics().record_upstream_query(&address);

        let result = timeout(limit, self.transport.query(upstream.address(), source, request))
            .await
            .map_err(|_| ResolverError::Timeout)
            .and_then(|r| r);

        match result {
            Ok((response, rtt)) => {
                upstream.record_success(rtt);
                metrics().record_upstream_latency(&address, rtt);
                Ok(response)
            }
            Err(e) => {
                metrics().record_upstream_failure(&address, failure_kind(&e));
                if upstream.record_failure() {
                    if let Some(prober) = self.prober.lock().as_ref() {
                        prober.add(Arc::clone(upstream), source, request);
                    }
                }
                Err(e)
            }
        }
    }

    async fn forward(&self, client: &Client, group: &UpstreamGroup, state: &State) -> Result<Message> {
        let upstreams = group.available();
        if upstreams.is_empty() {
            return Err(ResolverError::NoUpstream);
        }

        let source = self.query_source.query_source(&client.view);
        let mut request = client.request.clone();
        request.set_id(rand::random());
        request.set_message_type(MessageType::Query);
        request.set_recursion_desired(true);

        let mut last_error = None;
        for (attempt, upstream) in upstreams.iter().take(state.retries.max(1)).enumerate() {
            debug!(
                attempt,
                upstream = %upstream.address(),
                question = %client.question().name(),
                "Forwarding query"
            );

            match self.query_upstream(upstream, source, &request, state.timeout).await {
                Ok(response) if response.response_code() == ResponseCode::ServFail => {
                    last_error = Some(ResolverError::ServFail);
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(error = %e, "Upstream query failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ResolverError::AllUpstreamsFailed))
    }
}

fn failure_kind(e: &ResolverError) -> &'static str {
    match e {
        ResolverError::Timeout => "timeout",
        ResolverError::Network(_) => "network",
        _ => "protocol",
    }
}

#[async_trait]
impl Resolver for Forwarder {
    async fn resolve(&self, client: &mut Client) {
        // A referral from an earlier stage is left for the recursor.
        if client.response.is_some() {
            return;
        }

        let state = self.state.load_full();
        let Some(group) = state
            .views
            .get(&client.view)
            .and_then(|zones| find_upstreams(zones, client.question().name()))
        else {
            return;
        };

        match self.forward(client, group, &state).await {
            Ok(mut response) => {
                response.set_id(client.id());
                response.set_authoritative(false);
                client.response = Some(response);
                client.cache_answer = true;
            }
            Err(e) => {
                debug!(question = %client.question().name(), error = %e, "Forwarding failed");
            }
        }
    }
}
