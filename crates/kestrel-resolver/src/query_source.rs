//! Per-view outbound source addresses.

use kestrel_core::DEFAULT_VIEW;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;

/// Maps views to the local address outbound queries are sent from.
#[derive(Debug, Default)]
pub struct QuerySourceManager {
    sources: RwLock<HashMap<String, IpAddr>>,
}

impl QuerySourceManager {
    pub fn new(sources: HashMap<String, IpAddr>) -> Self {
        Self {
            sources: RwLock::new(sources),
        }
    }

    /// Replaces every mapping.
    pub fn reload_config(&self, sources: HashMap<String, IpAddr>) {
        *self.sources.write() = sources;
    }

    /// Source address for `view`, falling back to the default view's.
    pub fn query_source(&self, view: &str) -> Option<IpAddr> {
        let sources = self.sources.read();
        sources
            .get(view)
            .or_else(|| sources.get(DEFAULT_VIEW))
            .copied()
    }
}
