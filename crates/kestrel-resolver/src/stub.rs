//! Stub zones: questions under a zone are sent, without recursion, to the
//! zone's master servers.

use crate::name_tree::NameTree;
use crate::query_source::QuerySourceManager;
use crate::recursor::transport::Transport;
use crate::{ResolverError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Name;
use kestrel_core::message::error_response;
use kestrel_core::{Client, Resolver};
use kestrel_metrics::metrics;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Time allowed for the masters of a zone to answer.
pub const STUB_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// One stub zone.
#[derive(Debug, Clone, Default)]
pub struct StubZoneConfig {
    pub zone: String,
    pub masters: Vec<SocketAddr>,
}

/// Stub zones per view.
#[derive(Debug, Clone, Default)]
pub struct StubConfig {
    pub views: HashMap<String, Vec<StubZoneConfig>>,
}

/// Stub zones of one view.
pub type StubZones = NameTree<Arc<[SocketAddr]>>;

/// Resolver stage for stub zones.
pub struct StubResolver {
    views: ArcSwap<HashMap<String, StubZones>>,
    query_source: Arc<QuerySourceManager>,
    transport: Arc<dyn Transport>,
}

impl StubResolver {
    pub fn new(
        config: &StubConfig,
        query_source: Arc<QuerySourceManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Ok(Self {
            views: ArcSwap::from_pointee(Self::load_views(config)?),
            query_source,
            transport,
        })
    }

    /// Builds the per-view zone trees.
    pub fn load_views(config: &StubConfig) -> Result<HashMap<String, StubZones>> {
        let mut views = HashMap::new();
        for (view, zones) in &config.views {
            let mut tree = NameTree::new();
            for zone in zones {
                let name = Name::from_str(&zone.zone).map_err(|e| {
                    ResolverError::Protocol(format!("invalid stub zone {}: {e}", zone.zone))
                })?;
                if zone.masters.is_empty() {
                    return Err(ResolverError::NoUpstream);
                }
                tree.insert(&name, Arc::from(zone.masters.as_slice()));
            }
            views.insert(view.clone(), tree);
        }
        Ok(views)
    }

    pub fn reload_config(&self, config: &StubConfig) -> Result<()> {
        self.swap_views(Self::load_views(config)?);
        Ok(())
    }

    pub(crate) fn swap_views(&self, views: HashMap<String, StubZones>) {
        self.views.store(Arc::new(views));
    }

    fn masters(&self, view: &str, name: &Name) -> Option<Arc<[SocketAddr]>> {
        self.views
            .load()
            .get(view)
            .and_then(|zones| zones.find_closest(name))
            .cloned()
    }

    async fn query_master(
        &self,
        master: SocketAddr,
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<Message> {
        let address = master.to_string();
        metrics().record_upstream_query(&address);
        match self.transport.query(master, source, request).await {
            Ok((response, rtt)) => {
                metrics().record_upstream_latency(&address, rtt);
                match response.response_code() {
                    ResponseCode::NoError | ResponseCode::NXDomain => Ok(response),
                    rcode => {
                        debug!(%master, ?rcode, "Stub master returned an error");
                        Err(ResolverError::ServFail)
                    }
                }
            }
            Err(e) => {
                metrics().record_upstream_failure(&address, "transport");
                debug!(%master, error = %e, "Stub master query failed");
                Err(e)
            }
        }
    }

    /// Asks every master at once and keeps the first usable answer.
    async fn query_masters(
        &self,
        masters: &[SocketAddr],
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<Message> {
        let mut pending: FuturesUnordered<_> = masters
            .iter()
            .map(|master| self.query_master(*master, source, request))
            .collect();

        let first = async {
            let mut last_error = ResolverError::AllServersFailed;
            while let Some(result) = pending.next().await {
                match result {
                    Ok(response) => return Ok(response),
                    Err(e) => last_error = e,
                }
            }
            Err(last_error)
        };

        timeout(STUB_QUERY_TIMEOUT, first)
            .await
            .map_err(|_| ResolverError::QueryTimeout)?
    }
}

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(&self, client: &mut Client) {
        // A referral from an earlier stage is left for the recursor.
        if client.response.is_some() {
            return;
        }
        let Some(masters) = self.masters(&client.view, client.question().name()) else {
            return;
        };

        let source = self.query_source.query_source(&client.view);
        let mut request = client.request.clone();
        request.set_id(rand::random());
        request.set_message_type(MessageType::Query);
        request.set_recursion_desired(false);

        let response = match self.query_masters(&masters, source, &request).await {
            Ok(mut response) => {
                debug!(
                    question = %client.question().name(),
                    rcode = ?response.response_code(),
                    "Stub zone answered"
                );
                response.set_id(client.id());
                response
            }
            Err(e) => {
                debug!(question = %client.question().name(), error = %e, "Stub zone query failed");
                error_response(&client.request, ResponseCode::ServFail)
            }
        };
        client.response = Some(response);
        client.cache_answer = false;
    }
}
