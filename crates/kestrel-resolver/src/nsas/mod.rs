//! Nameserver address store.
//!
//! Tracks the delegations seen while resolving (zone → nameserver names) and
//! the addresses of those nameservers together with their smoothed RTT. Zones
//! live in a label tree for closest-enclosing lookups and in an LRU list that
//! bounds memory; nameserver entries are shared between zones and removed
//! together with the zone that referenced them.

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, RecordType};
use kestrel_cache::LruList;
use kestrel_core::message::{ns_target, rrset_count};
use kestrel_metrics::metrics;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::name_tree::NameTree;

mod address;
mod nameserver;
mod zone;

pub use address::{AddressEntry, UNREACHABLE_RTT};
pub use nameserver::{NameServer, NameServerEntry, NameServerManager};
pub use zone::ZoneEntry;

/// Zone capacity used when none (or a non-positive one) is configured.
pub const DEFAULT_MAX_ZONES: usize = 4096;

/// Empty-leaf percentage above which the zone tree is compacted.
pub const EMPTY_NODE_WATERMARK: usize = 40;

/// Number of LRU-tail entries inspected for expiry per enforcement round.
pub const EXPIRED_ZONE_CHECK_BATCH: usize = 100;

/// NSAS error.
#[derive(Error, Debug)]
pub enum NsasError {
    #[error("Authority section should hold exactly one NS rrset")]
    InvalidAuthSection,

    #[error("Nameserver {0} has no address")]
    NoAddress(Name),

    #[error("Nameserver {0} is unknown")]
    UnknownNameServer(Name),

    #[error("Address {0} is unknown")]
    UnknownAddress(SocketAddr),
}

/// How much a piece of delegation data is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    /// Glue for a name outside the zone of the server that sent it.
    OutOfZone = 0,
    /// Taken from a non-authoritative referral.
    FromReferral = 1,
    /// Taken from an authoritative answer.
    FromAuth = 2,
}

/// Outcome of recording a delegation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneServers {
    /// Nameservers whose address must be resolved (or re-probed).
    pub missing: Vec<Name>,
    /// Nameservers with a usable address.
    pub known: Vec<Name>,
}

struct Glue {
    name: Name,
    ttl: u32,
    addrs: Vec<SocketAddr>,
}

struct Delegation {
    zone: Name,
    ttl: u32,
    name_servers: Vec<Name>,
    glues: Vec<Glue>,
}

/// Extracts the NS rrset and its A glue from a response.
fn auth_and_glues(msg: &Message) -> Result<Delegation, NsasError> {
    let is_ns_query = msg
        .queries()
        .first()
        .is_some_and(|q| q.query_type() == RecordType::NS);

    let auth = if is_ns_query && rrset_count(msg.answers()) == 1 {
        msg.answers()
    } else if rrset_count(msg.name_servers()) == 1 {
        msg.name_servers()
    } else {
        return Err(NsasError::InvalidAuthSection);
    };

    let first = auth.first().ok_or(NsasError::InvalidAuthSection)?;
    if first.record_type() != RecordType::NS {
        return Err(NsasError::InvalidAuthSection);
    }

    let name_servers: Vec<Name> = auth.iter().filter_map(ns_target).cloned().collect();
    let glues = name_servers
        .iter()
        .filter_map(|ns| {
            let mut ttl = 0;
            let addrs: Vec<SocketAddr> = msg
                .additionals()
                .iter()
                .filter(|r| r.name() == ns)
                .filter_map(|r| match r.data() {
                    Some(RData::A(a)) => {
                        ttl = r.ttl();
                        Some(SocketAddr::new(IpAddr::V4(a.0), 53))
                    }
                    _ => None,
                })
                .collect();
            (!addrs.is_empty()).then(|| Glue {
                name: ns.clone(),
                ttl,
                addrs,
            })
        })
        .collect();

    Ok(Delegation {
        zone: first.name().clone(),
        ttl: auth.iter().map(|r| r.ttl()).min().unwrap_or(0),
        name_servers,
        glues,
    })
}

struct Zones {
    tree: NameTree<Name>,
    lru: LruList<Name, ZoneEntry>,
}

/// The nameserver address store.
pub struct NsasCache {
    zones: Mutex<Zones>,
    name_servers: NameServerManager,
    max_size: usize,
}

impl NsasCache {
    /// Creates a store holding at most `max_size` zones (0 means the default).
    pub fn new(max_size: usize) -> Self {
        Self {
            zones: Mutex::new(Zones {
                tree: NameTree::new(),
                lru: LruList::new(),
            }),
            name_servers: NameServerManager::new(),
            max_size: if max_size == 0 { DEFAULT_MAX_ZONES } else { max_size },
        }
    }

    /// Records the delegation carried by `msg`, which was sent by a server
    /// of `zone`.
    pub fn add_zone_name_server(&self, zone: &Name, msg: &Message) -> Result<ZoneServers, NsasError> {
        let delegation = auth_and_glues(msg)?;

        for glue in delegation.glues {
            let trust = if zone.zone_of(&glue.name) {
                TrustLevel::FromAuth
            } else {
                TrustLevel::OutOfZone
            };
            self.name_servers.add(
                glue.name,
                Duration::from_secs(u64::from(glue.ttl)),
                glue.addrs,
                trust,
            )?;
        }

        let trust = if msg.authoritative() {
            TrustLevel::FromAuth
        } else {
            TrustLevel::FromReferral
        };

        let mut servers = ZoneServers::default();
        for name in &delegation.name_servers {
            match self.name_servers.get(name) {
                Some(entry) if !entry.is_expired() => {
                    // Out-of-zone glue is used now but probed again in the background.
                    if entry.trust() == TrustLevel::OutOfZone {
                        servers.missing.push(name.clone());
                    }
                    servers.known.push(name.clone());
                }
                _ => servers.missing.push(name.clone()),
            }
        }

        let key = delegation.zone.to_lowercase();
        let mut zones = self.zones.lock();
        if let Some(old) = zones.lru.get(&key) {
            if !old.is_expired() && old.trust() > trust {
                zones.lru.touch(&key);
                return Ok(ZoneServers::default());
            }
        }

        debug!(zone = %delegation.zone, ?trust, servers = delegation.name_servers.len(), "Recording delegation");
        let entry = ZoneEntry::new(
            delegation.zone.clone(),
            delegation.name_servers,
            Duration::from_secs(u64::from(delegation.ttl)),
            trust,
        );
        zones.lru.insert(key.clone(), entry);
        zones.tree.insert(&delegation.zone, key);
        Ok(servers)
    }

    /// Selects nameservers for the closest enclosing zone of `name` that
    /// still has a live server.
    pub fn select_name_servers(&self, name: &Name) -> Option<Vec<NameServer>> {
        let mut zones = self.zones.lock();
        loop {
            let key = zones.tree.find_closest(name)?.clone();
            let servers = match zones.lru.get(&key) {
                Some(entry) if !entry.is_expired() => entry.select_name_servers(&self.name_servers),
                _ => Vec::new(),
            };

            if servers.is_empty() {
                self.remove_zone(&mut zones, &key);
                continue;
            }

            zones.lru.touch(&key);
            return Some(servers);
        }
    }

    /// Folds an RTT sample into the server's address entry.
    pub fn update_rtt(&self, server: &NameServer, rtt: Duration) -> Result<(), NsasError> {
        self.name_servers.update_rtt(server, rtt)
    }

    /// Records the address of a nameserver resolved on its own.
    pub fn add_name_server(
        &self,
        name: Name,
        ttl: Duration,
        addrs: Vec<SocketAddr>,
        trust: TrustLevel,
    ) -> Result<(), NsasError> {
        self.name_servers.add(name, ttl, addrs, trust)
    }

    /// Looks up a nameserver entry.
    pub fn name_server(&self, name: &Name) -> Option<Arc<NameServerEntry>> {
        self.name_servers.get(name)
    }

    /// Brings the store back under its zone capacity.
    pub fn enforce_memory_limit(&self) {
        let mut zones = self.zones.lock();
        if zones.tree.empty_leaf_ratio() > EMPTY_NODE_WATERMARK {
            zones.tree.prune_empty_leaves();
        }

        let count = zones.lru.len();
        if count <= self.max_size {
            metrics().set_nsas_zones(count);
            return;
        }

        let expired: Vec<Name> = zones
            .lru
            .iter_rev()
            .take(EXPIRED_ZONE_CHECK_BATCH)
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_zone(&mut zones, key);
        }

        let mut evicted = 0;
        while zones.lru.len() > self.max_size {
            let Some((key, entry)) = zones.lru.pop_back() else {
                break;
            };
            zones.tree.remove(&key);
            self.name_servers.delete(entry.name_servers());
            evicted += 1;
        }

        info!(
            zones = count,
            expired = expired.len(),
            evicted,
            remaining = zones.lru.len(),
            "Reclaimed NSAS memory"
        );
        metrics().set_nsas_zones(zones.lru.len());
    }

    /// Number of zones held.
    pub fn zone_count(&self) -> usize {
        self.zones.lock().lru.len()
    }

    fn remove_zone(&self, zones: &mut Zones, key: &Name) {
        zones.tree.remove(key);
        if let Some(entry) = zones.lru.remove(key) {
            self.name_servers.delete(entry.name_servers());
        }
    }
}
