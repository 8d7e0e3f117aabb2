//! Authoritative answers from locally configured zones.

mod memory_zone;

pub use memory_zone::MemoryZone;

use crate::name_tree::NameTree;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, Record, RecordType};
use kestrel_core::message::make_response;
use kestrel_core::{Client, Resolver};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading a zone.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("invalid zone origin {0}")]
    InvalidOrigin(String),

    #[error("zone {origin} line {line}: {reason}")]
    Parse {
        origin: String,
        line: usize,
        reason: String,
    },

    #[error("record {name} is outside zone {origin}")]
    OutOfZone { name: Name, origin: Name },

    #[error("invalid zone data in {origin}: {reason}")]
    Invalid { origin: Name, reason: String },
}

/// One locally served zone, as configured.
#[derive(Debug, Clone, Default)]
pub struct AuthZoneConfig {
    pub origin: String,

    /// Records in `owner [ttl] [class] type rdata` form. Relative owners and
    /// targets are completed with the origin; `@` is the origin itself.
    pub records: Vec<String>,
}

/// Locally served zones per view.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub views: HashMap<String, Vec<AuthZoneConfig>>,
}

/// What kind of data a zone lookup found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResultKind {
    Success,
    NXDomain,
    NXRRset,
    Delegation,
    CName,
}

/// Lookup flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOption {
    Default,
    /// Attach addresses of in-zone nameservers.
    GlueOk,
}

/// Result of [`Zone::find`].
#[derive(Debug, Clone)]
pub struct FindResult {
    pub kind: FindResultKind,
    pub rrset: Vec<Record>,
    pub additional: Vec<Record>,
}

impl FindResult {
    pub(crate) fn new(kind: FindResultKind) -> Self {
        Self {
            kind,
            rrset: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// A zone the auth stage can answer from.
pub trait Zone: Send + Sync {
    fn origin(&self) -> &Name;

    fn find(&self, name: &Name, rtype: RecordType, option: FindOption) -> FindResult;
}

/// Zones of one view, keyed by origin.
pub type AuthZones = NameTree<Arc<dyn Zone>>;

/// The authoritative stage.
pub struct AuthResolver {
    views: ArcSwap<HashMap<String, AuthZones>>,
}

impl AuthResolver {
    pub fn new(config: &AuthConfig) -> Result<Self, ZoneError> {
        Ok(Self {
            views: ArcSwap::from_pointee(Self::load_views(config)?),
        })
    }

    /// Parses every configured zone.
    pub fn load_views(config: &AuthConfig) -> Result<HashMap<String, AuthZones>, ZoneError> {
        let mut views = HashMap::new();
        for (view, zones) in &config.views {
            let mut tree = AuthZones::new();
            for zone in zones {
                let zone = MemoryZone::from_config(zone)?;
                let origin = zone.origin().clone();
                tree.insert(&origin, Arc::new(zone) as Arc<dyn Zone>);
            }
            views.insert(view.clone(), tree);
        }
        Ok(views)
    }

    pub fn reload_config(&self, config: &AuthConfig) -> Result<(), ZoneError> {
        self.swap_views(Self::load_views(config)?);
        Ok(())
    }

    pub(crate) fn swap_views(&self, views: HashMap<String, AuthZones>) {
        self.views.store(Arc::new(views));
    }

    /// Number of zones served in a view.
    pub fn zone_count(&self, view: &str) -> usize {
        self.views.load().get(view).map_or(0, |zones| zones.len())
    }
}

fn negative_soa(zone: &dyn Zone) -> Vec<Record> {
    zone.find(zone.origin(), RecordType::SOA, FindOption::Default)
        .rrset
}

#[async_trait]
impl Resolver for AuthResolver {
    async fn resolve(&self, client: &mut Client) {
        let views = self.views.load();
        let qname = client.question().name().clone();
        let Some(zone) = views
            .get(&client.view)
            .and_then(|zones| zones.find_closest(&qname))
            .cloned()
        else {
            return;
        };

        let qtype = client.question().query_type();
        let result = zone.find(&qname, qtype, FindOption::GlueOk);
        debug!(question = %qname, zone = %zone.origin(), kind = ?result.kind, "Auth lookup");

        let mut response = make_response(&client.request);
        response.set_authoritative(true);
        match result.kind {
            FindResultKind::Success => {
                let apex_ns = qtype == RecordType::NS && qname == *zone.origin();
                response.insert_answers(result.rrset);
                if !apex_ns {
                    response.insert_name_servers(
                        zone.find(zone.origin(), RecordType::NS, FindOption::Default)
                            .rrset,
                    );
                }
                response.insert_additionals(result.additional);
            }
            FindResultKind::CName => {
                response.insert_answers(result.rrset);
            }
            FindResultKind::NXDomain => {
                response.set_response_code(ResponseCode::NXDomain);
                response.insert_name_servers(negative_soa(zone.as_ref()));
            }
            FindResultKind::NXRRset => {
                response.insert_name_servers(negative_soa(zone.as_ref()));
            }
            FindResultKind::Delegation => {
                response.set_authoritative(false);
                response.insert_name_servers(result.rrset);
                response.insert_additionals(result.additional);
            }
        }

        client.response = Some(response);
        client.cache_answer = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use kestrel_core::{classify_response, ResponseCategory};
    use std::str::FromStr;

    fn config() -> AuthConfig {
        AuthConfig {
            views: HashMap::from([(
                "default".to_string(),
                vec![AuthZoneConfig {
                    origin: "example.test.".into(),
                    records: [
                        "@ 3600 IN SOA ns1 hostmaster 2024010101 7200 3600 1209600 300",
                        "@ 3600 NS ns1",
                        "ns1 3600 A 192.0.2.53",
                        "www 300 A 192.0.2.10",
                        "www 300 A 192.0.2.11",
                        "alias 300 CNAME www",
                        "sub 3600 NS ns.sub",
                        "ns.sub 3600 A 192.0.2.99",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                }],
            )]),
        }
    }

    fn client(name: &str, rtype: RecordType, view: &str) -> Client {
        let mut request = Message::new();
        request.set_id(99);
        request.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        Client::new(request, "192.0.2.200:5353".parse().unwrap(), view).unwrap()
    }

    async fn ask(name: &str, rtype: RecordType) -> Client {
        let auth = AuthResolver::new(&config()).unwrap();
        let mut client = client(name, rtype, "default");
        auth.resolve(&mut client).await;
        client
    }

    #[tokio::test]
    async fn test_answer() {
        let client = ask("www.example.test.", RecordType::A).await;
        let response = client.response.unwrap();
        assert!(response.authoritative());
        assert_eq!(response.id(), 99);
        assert_eq!(response.answers().len(), 2);
        assert_eq!(response.name_servers().len(), 1);
        assert!(!client.cache_answer);
    }

    #[tokio::test]
    async fn test_cname() {
        let response = ask("alias.example.test.", RecordType::A).await.response.unwrap();
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].record_type(), RecordType::CNAME);
    }

    #[tokio::test]
    async fn test_negative_answers_carry_soa() {
        let response = ask("nope.example.test.", RecordType::A).await.response.unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.name_servers()[0].record_type(), RecordType::SOA);

        let response = ask("www.example.test.", RecordType::MX).await.response.unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(classify_response(&response), ResponseCategory::NxRrset);
    }

    #[tokio::test]
    async fn test_delegation_is_a_referral_with_glue() {
        let response = ask("host.sub.example.test.", RecordType::A).await.response.unwrap();
        assert!(!response.authoritative());
        assert_eq!(classify_response(&response), ResponseCategory::Referral);
        assert_eq!(response.additionals().len(), 1);
    }

    #[tokio::test]
    async fn test_other_zones_and_views_pass_through() {
        let auth = AuthResolver::new(&config()).unwrap();

        let mut outside = client("www.example.com.", RecordType::A, "default");
        auth.resolve(&mut outside).await;
        assert!(outside.response.is_none());

        let mut other_view = client("www.example.test.", RecordType::A, "office");
        auth.resolve(&mut other_view).await;
        assert!(other_view.response.is_none());
    }

    #[tokio::test]
    async fn test_reload_replaces_zones() {
        let auth = AuthResolver::new(&config()).unwrap();
        assert_eq!(auth.zone_count("default"), 1);

        auth.reload_config(&AuthConfig::default()).unwrap();
        assert_eq!(auth.zone_count("default"), 0);

        let mut client = client("www.example.test.", RecordType::A, "default");
        auth.resolve(&mut client).await;
        assert!(client.response.is_none());
    }
}
