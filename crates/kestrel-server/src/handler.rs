//! Request decoding, view selection and response encoding shared by the
//! UDP and TCP servers.

use super::view::ViewSelector;
use super::Protocol;
use arc_swap::ArcSwap;
use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use kestrel_core::message::{error_response, make_response};
use kestrel_core::{Client, QueryHandler};
use kestrel_metrics::{metrics, QueryTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Smallest payload every client must accept over UDP.
const MIN_UDP_PAYLOAD: u16 = 512;

/// Payload we advertise in responses to EDNS clients.
const SERVER_UDP_PAYLOAD: u16 = 4096;

/// Context for a DNS query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Client address.
    pub client: SocketAddr,

    /// Protocol used.
    pub protocol: Protocol,

    /// EDNS UDP payload size (if applicable).
    pub udp_size: Option<u16>,
}

impl QueryContext {
    /// Creates a new query context.
    pub fn new(client: SocketAddr, protocol: Protocol) -> Self {
        Self {
            client,
            protocol,
            udp_size: None,
        }
    }

    /// Sets the EDNS UDP size.
    pub fn with_udp_size(mut self, size: u16) -> Self {
        self.udp_size = Some(size);
        self
    }

    /// Returns the maximum response size.
    pub fn max_response_size(&self) -> usize {
        match self.protocol {
            Protocol::Udp => usize::from(self.udp_size.unwrap_or(MIN_UDP_PAYLOAD).max(MIN_UDP_PAYLOAD)),
            Protocol::Tcp => 65535,
        }
    }
}

/// Runs wire requests through the query pipeline.
pub struct Dispatcher {
    pipeline: Arc<dyn QueryHandler>,
    views: ArcSwap<ViewSelector>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<dyn QueryHandler>, views: ViewSelector) -> Self {
        Self {
            pipeline,
            views: ArcSwap::from_pointee(views),
        }
    }

    /// Replaces the view mapping.
    pub fn set_views(&self, views: ViewSelector) {
        self.views.store(Arc::new(views));
    }

    /// Handles one wire request. Malformed packets get no answer.
    pub async fn handle(&self, data: &[u8], ctx: QueryContext) -> Option<Vec<u8>> {
        let request = match Message::from_vec(data) {
            Ok(msg) if msg.message_type() == MessageType::Query => msg,
            Ok(_) => return None,
            Err(e) => {
                trace!(error = %e, client = %ctx.client, "Failed to parse DNS query");
                return None;
            }
        };

        let ctx = match request.extensions() {
            Some(edns) => ctx.with_udp_size(edns.max_payload()),
            None => ctx,
        };
        let timer = QueryTimer::start(ctx.protocol.name());
        let response = self.resolve(request, &ctx).await;
        let wire = encode(&response, &ctx);

        metrics().record_response(ctx.protocol.name(), &response.response_code().to_string());
        timer.finish();
        wire
    }

    async fn resolve(&self, request: Message, ctx: &QueryContext) -> Message {
        let view = self.views.load().select(ctx.client.ip()).to_string();
        metrics().record_query(ctx.protocol.name(), &view);

        let edns = request.extensions().is_some();
        let mut client = match Client::new(request.clone(), ctx.client, view) {
            Ok(client) => client,
            Err(e) => {
                debug!(client = %ctx.client, error = %e, "Rejecting query");
                return error_response(&request, ResponseCode::FormErr);
            }
        };

        self.pipeline.handle_query(&mut client).await;

        let mut response = client
            .response
            .take()
            .unwrap_or_else(|| error_response(&client.request, ResponseCode::ServFail));
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_recursion_desired(request.recursion_desired());

        // Upstream OPT records (and their options) are never passed on.
        *response.extensions_mut() = None;
        if edns {
            let mut opt = Edns::new();
            opt.set_max_payload(SERVER_UDP_PAYLOAD);
            response.set_edns(opt);
        }
        response
    }
}

/// Encodes a response, replacing it with an empty truncated one if it does
/// not fit the client's UDP payload.
fn encode(response: &Message, ctx: &QueryContext) -> Option<Vec<u8>> {
    let wire = match response.to_vec() {
        Ok(wire) => wire,
        Err(e) => {
            debug!(error = %e, "Failed to encode response");
            return error_response(response, ResponseCode::ServFail).to_vec().ok();
        }
    };

    if wire.len() <= ctx.max_response_size() {
        return Some(wire);
    }

    let mut truncated = make_response(response);
    truncated
        .set_message_type(MessageType::Response)
        .set_truncated(true)
        .set_authoritative(response.authoritative())
        .set_recursion_available(response.recursion_available())
        .set_response_code(response.response_code());
    if let Some(edns) = response.extensions().clone() {
        truncated.set_edns(edns);
    }
    truncated.to_vec().ok()
}
