//! Nameserver entries and the manager that owns them.

use super::address::AddressEntry;
use super::{NsasError, TrustLevel};
use hickory_proto::rr::Name;
use kestrel_core::message::name_hash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A selected nameserver address, ready to be queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    /// Zone the server was selected for.
    pub zone: Name,
    /// Nameserver host name.
    pub name: Name,
    /// Address to query.
    pub addr: SocketAddr,
    /// Smoothed RTT at selection time.
    pub rtt: Duration,
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} ns {} A {}]", self.zone, self.name, self.addr)
    }
}

/// All known addresses of one nameserver host.
#[derive(Debug)]
pub struct NameServerEntry {
    name: Name,
    addrs: Vec<AddressEntry>,
    expire_at: Instant,
    trust: TrustLevel,
}

impl NameServerEntry {
    /// Creates an entry. At least one address is required.
    pub fn new(
        name: Name,
        ttl: Duration,
        addrs: Vec<SocketAddr>,
        trust: TrustLevel,
    ) -> Result<Self, NsasError> {
        if addrs.is_empty() {
            return Err(NsasError::NoAddress(name));
        }

        Ok(Self {
            name,
            addrs: addrs.into_iter().map(AddressEntry::new).collect(),
            expire_at: Instant::now() + ttl,
            trust,
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn addrs(&self) -> &[AddressEntry] {
        &self.addrs
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }

    pub fn is_expired(&self) -> bool {
        self.expire_at <= Instant::now()
    }

    /// The address with the lowest RTT.
    pub fn select(&self) -> Option<&AddressEntry> {
        self.addrs.iter().min_by_key(|a| a.rtt())
    }

    fn update_rtt(&self, addr: SocketAddr, rtt: Duration) -> Result<(), NsasError> {
        let entry = self
            .addrs
            .iter()
            .find(|a| a.addr() == addr)
            .ok_or(NsasError::UnknownAddress(addr))?;
        entry.update_rtt(rtt);
        Ok(())
    }
}

/// Nameserver entries keyed by name hash.
#[derive(Debug, Default)]
pub struct NameServerManager {
    entries: RwLock<HashMap<u32, Arc<NameServerEntry>>>,
}

impl NameServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a nameserver unless a live entry with at least the same trust
    /// is already present.
    pub fn add(
        &self,
        name: Name,
        ttl: Duration,
        addrs: Vec<SocketAddr>,
        trust: TrustLevel,
    ) -> Result<(), NsasError> {
        let entry = NameServerEntry::new(name, ttl, addrs, trust)?;
        let key = name_hash(&entry.name);

        let mut entries = self.entries.write();
        if let Some(old) = entries.get(&key) {
            if !old.is_expired() && old.trust >= trust {
                return Ok(());
            }
        }
        entries.insert(key, Arc::new(entry));
        Ok(())
    }

    /// Looks up a nameserver by exact name.
    pub fn get(&self, name: &Name) -> Option<Arc<NameServerEntry>> {
        self.entries
            .read()
            .get(&name_hash(name))
            .filter(|e| &e.name == name)
            .cloned()
    }

    /// Folds an RTT sample into the address the server was reached at.
    pub fn update_rtt(&self, server: &NameServer, rtt: Duration) -> Result<(), NsasError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&name_hash(&server.name))
            .filter(|e| e.name == server.name)
            .ok_or_else(|| NsasError::UnknownNameServer(server.name.clone()))?;
        entry.update_rtt(server.addr, rtt)
    }

    /// Removes the given nameservers.
    pub fn delete(&self, names: &[Name]) {
        let mut entries = self.entries.write();
        for name in names {
            let key = name_hash(name);
            if entries.get(&key).is_some_and(|e| &e.name == name) {
                entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
