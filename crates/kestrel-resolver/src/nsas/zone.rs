//! Delegation entries: a zone and the names of its nameservers.

use super::nameserver::{NameServer, NameServerManager};
use super::TrustLevel;
use hickory_proto::rr::Name;
use std::time::Duration;
use tokio::time::Instant;

/// A zone cut learned from a referral or an authoritative NS answer.
#[derive(Debug, Clone)]
pub struct ZoneEntry {
    zone: Name,
    name_servers: Vec<Name>,
    expire_at: Instant,
    trust: TrustLevel,
}

impl ZoneEntry {
    pub fn new(zone: Name, name_servers: Vec<Name>, ttl: Duration, trust: TrustLevel) -> Self {
        Self {
            zone,
            name_servers,
            expire_at: Instant::now() + ttl,
            trust,
        }
    }

    pub fn zone(&self) -> &Name {
        &self.zone
    }

    pub fn name_servers(&self) -> &[Name] {
        &self.name_servers
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }

    pub fn is_expired(&self) -> bool {
        self.expire_at <= Instant::now()
    }

    /// Picks the best address of every nameserver that is still known.
    pub fn select_name_servers(&self, manager: &NameServerManager) -> Vec<NameServer> {
        self.name_servers
            .iter()
            .filter_map(|name| manager.get(name))
            .filter(|entry| !entry.is_expired())
            .filter_map(|entry| {
                entry.select().map(|addr| NameServer {
                    zone: self.zone.clone(),
                    name: entry.name().clone(),
                    addr: addr.addr(),
                    rtt: addr.rtt(),
                })
            })
            .collect()
    }
}
