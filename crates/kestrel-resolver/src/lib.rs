//! # Kestrel DNS Resolver
//!
//! The resolving half of the Kestrel pipeline.
//!
//! ## Architecture
//!
//! Stages are composed as
//! `CNameHandler(Chain[auth, QueryLimit(Chain[stub, forwarder, recursor])])`:
//!
//! - **AuthResolver**: answers from locally configured zones
//! - **QueryLimit**: collapses concurrent identical outbound resolutions
//! - **StubResolver**: asks the master servers of stub zones directly
//! - **Forwarder**: sends queries for configured zones to upstream resolvers,
//!   probing the ones that stop answering
//! - **Recursor**: iterative resolution from the root, backed by the
//!   nameserver address store ([`nsas`])
//! - **CNameHandler**: follows alias chains through the whole stack
//!
//! ## Features
//!
//! - Delegation tracking with trust levels and RTT-smoothed server selection
//! - Parallel nameserver racing with per-query depth and time budgets
//! - Background resolution of missing glue
//! - Per-view configuration with hot reload

use async_trait::async_trait;
use kestrel_core::{Client, QueryHandler, Resolver, ResolverChain};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub mod auth;
pub mod cname;
pub mod forward;
pub mod name_tree;
pub mod nsas;
pub mod prober;
pub mod query_limit;
pub mod query_source;
pub mod recursor;
pub mod stub;
pub mod upstream;

pub use auth::{AuthConfig, AuthResolver, AuthZoneConfig, MemoryZone, Zone, ZoneError};
pub use cname::CNameHandler;
pub use forward::{ForwardZoneConfig, Forwarder, ForwarderConfig, ZoneMatch};
pub use nsas::{NameServer, NsasCache, NsasError, TrustLevel};
pub use query_limit::QueryLimit;
pub use query_source::QuerySourceManager;
pub use recursor::root_hint::RootHintError;
pub use recursor::transport::{Transport, UdpTransport};
pub use recursor::{Recursor, RecursorConfig, RecursorViewConfig};
pub use stub::{StubConfig, StubResolver, StubZoneConfig};
pub use upstream::{Upstream, UpstreamGroup};

/// Resolver error.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Timeout")]
    Timeout,

    #[error("No upstream available")]
    NoUpstream,

    #[error("All upstreams failed")]
    AllUpstreamsFailed,

    #[error("SERVFAIL from upstream")]
    ServFail,

    #[error("Query exceeds depth limit")]
    TooDeepQuery,

    #[error("Response is invalid")]
    InvalidResponse,

    #[error("Query timed out")]
    QueryTimeout,

    #[error("All nameservers failed")]
    AllServersFailed,

    #[error("Auth nameserver is dumb")]
    DumbNameServer,

    #[error("CNAME chain is too long")]
    CNameChainTooLong,

    #[error("CNAME loop detected")]
    CNameCircleDetected,

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error(transparent)]
    Nsas(#[from] NsasError),

    #[error(transparent)]
    RootHint(#[from] RootHintError),

    #[error(transparent)]
    Zone(#[from] ZoneError),
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;

/// Everything the resolver stages are configured from.
#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    /// Follow CNAMEs found in the first answer rrset instead of the last.
    pub check_cname_indirect: bool,

    /// Number of query handlers; bounds concurrent outbound resolutions.
    pub handler_count: usize,

    /// Outbound source address per view.
    pub query_sources: HashMap<String, IpAddr>,

    /// Locally served zones.
    pub auth: AuthConfig,

    /// Zones answered by their own masters.
    pub stub: StubConfig,

    /// Forward zones.
    pub forwarder: ForwarderConfig,

    /// Recursion.
    pub recursor: RecursorConfig,
}

/// The resolver stage of the query pipeline.
pub struct ResolverManager {
    resolver: Arc<CNameHandler>,
    query_limit: Arc<QueryLimit>,
    auth: Arc<AuthResolver>,
    stub: Arc<StubResolver>,
    forwarder: Arc<Forwarder>,
    recursor: Arc<Recursor>,
    query_source: Arc<QuerySourceManager>,
}

impl ResolverManager {
    /// Builds every stage. Must be called within a Tokio runtime.
    pub fn new(settings: ResolverSettings, transport: Arc<dyn Transport>) -> Result<Self> {
        let query_source = Arc::new(QuerySourceManager::new(settings.query_sources));
        let auth = Arc::new(AuthResolver::new(&settings.auth)?);
        let stub = Arc::new(StubResolver::new(
            &settings.stub,
            Arc::clone(&query_source),
            Arc::clone(&transport),
        )?);
        let forwarder = Arc::new(Forwarder::new(
            settings.forwarder,
            Arc::clone(&query_source),
            Arc::clone(&transport),
        )?);
        let recursor = Arc::new(Recursor::new(
            settings.recursor,
            Arc::clone(&query_source),
            transport,
        )?);

        let outbound = ResolverChain::new()
            .with(Arc::clone(&stub) as Arc<dyn Resolver>)
            .with(Arc::clone(&forwarder) as Arc<dyn Resolver>)
            .with(Arc::clone(&recursor) as Arc<dyn Resolver>);
        let query_limit = Arc::new(QueryLimit::new(Arc::new(outbound), settings.handler_count));
        let chain = ResolverChain::new()
            .with(Arc::clone(&auth) as Arc<dyn Resolver>)
            .with(Arc::clone(&query_limit) as Arc<dyn Resolver>);
        let resolver = Arc::new(CNameHandler::new(
            Arc::new(chain),
            settings.check_cname_indirect,
        ));

        Ok(Self {
            resolver,
            query_limit,
            auth,
            stub,
            forwarder,
            recursor,
            query_source,
        })
    }

    /// Applies a new configuration to every stage.
    pub async fn reload_config(&self, settings: ResolverSettings) -> Result<()> {
        // Validate everything that can fail before touching live state.
        let auth = AuthResolver::load_views(&settings.auth)?;
        let stub = StubResolver::load_views(&settings.stub)?;
        let forward = Forwarder::load_views(&settings.forwarder)?;
        let recursor = Recursor::load_views(&settings.recursor)?;

        self.query_source.reload_config(settings.query_sources);
        self.auth.swap_views(auth);
        self.stub.swap_views(stub);
        self.forwarder.swap_views(forward, &settings.forwarder).await;
        self.recursor.swap_views(recursor, settings.recursor.max_zones).await;
        self.query_limit.reload_config(settings.handler_count);
        self.resolver.set_check_cname_indirect(settings.check_cname_indirect);

        info!("Resolver configuration reloaded");
        Ok(())
    }

    /// Stops background work.
    pub async fn close(&self) {
        self.forwarder.close().await;
        self.recursor.close().await;
    }

    pub fn recursor(&self) -> &Arc<Recursor> {
        &self.recursor
    }

    pub fn query_source(&self) -> &Arc<QuerySourceManager> {
        &self.query_source
    }
}

#[async_trait]
impl QueryHandler for ResolverManager {
    async fn handle_query(&self, client: &mut Client) {
        self.resolver.resolve(client).await;
        if client.response.is_none() {
            debug!(question = %client.question().name(), view = %client.view, "No resolver stage answered");
        }
    }
}
