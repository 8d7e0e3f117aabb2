//! Resolver configuration: recursion, forwarding, stub zones, query sources
//! and local zones, each configured per view.

use super::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the resolver stage as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Follow the CNAME of the first answer rrset instead of the last.
    pub check_cname_indirect: bool,

    /// Capacity of the nameserver address store (0 = default).
    pub nsas_max_zones: usize,
}

/// Recursion for one view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursorViewConfig {
    pub view: String,

    pub enable: bool,

    /// Send the client subnet to authoritative servers.
    pub edns_subnet_enable: bool,

    /// Root hints file; the built-in root servers are used when unset.
    pub root_hint_file: Option<PathBuf>,
}

impl Default for RecursorViewConfig {
    fn default() -> Self {
        Self {
            view: super::DEFAULT_VIEW.to_string(),
            enable: true,
            edns_subnet_enable: false,
            root_hint_file: None,
        }
    }
}

/// Forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Forward zones per view.
    pub views: Vec<ForwardViewConfig>,

    /// Per-upstream query timeout (milliseconds).
    pub timeout_ms: u64,

    /// Upstreams tried per query.
    pub retries: usize,

    /// Time between probes of upstreams that stopped answering
    /// (milliseconds).
    pub probe_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            views: Vec::new(),
            timeout_ms: 3000,
            retries: 3,
            probe_interval_ms: 10_000,
        }
    }
}

impl ForwarderConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("forwarder.timeout_ms", "must be positive"));
        }
        if self.retries == 0 {
            return Err(ConfigError::invalid("forwarder.retries", "must be at least 1"));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::invalid("forwarder.probe_interval_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Forward zones of one view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardViewConfig {
    pub view: String,
    pub zones: Vec<ForwardZoneConfig>,
}

impl ForwardViewConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for zone in &self.zones {
            if zone.kind != ForwardZoneKind::Exception && zone.servers.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "forward zone {} in view {} has no servers",
                    zone.zone, self.view
                )));
            }
        }
        Ok(())
    }
}

/// Which names a forward zone applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardZoneKind {
    /// The zone and every name below it.
    #[default]
    Subdomain,
    /// The zone name only.
    Exact,
    /// Names at or below the zone are never forwarded.
    Exception,
}

/// One forward zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardZoneConfig {
    pub zone: String,
    pub servers: Vec<SocketAddr>,
    pub kind: ForwardZoneKind,
}

/// Stub zones of one view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StubViewConfig {
    pub view: String,
    pub zones: Vec<StubZoneConfig>,
}

impl StubViewConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for zone in &self.zones {
            if zone.masters.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "stub zone {} in view {} has no masters",
                    zone.zone, self.view
                )));
            }
        }
        Ok(())
    }
}

/// One stub zone and the servers that hold it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StubZoneConfig {
    pub zone: String,
    pub masters: Vec<SocketAddr>,
}

/// Outbound source address of one view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySourceConfig {
    pub view: String,
    pub address: IpAddr,
}

/// Locally served zones of one view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthViewConfig {
    pub view: String,
    pub zones: Vec<AuthZoneConfig>,
}

impl AuthViewConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for zone in &self.zones {
            if !zone.origin.ends_with('.') {
                return Err(ConfigError::invalid(
                    "auth.zones.origin",
                    format!("{} must be fully qualified", zone.origin),
                ));
            }
        }
        Ok(())
    }
}

/// One locally served zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthZoneConfig {
    pub origin: String,

    /// Records in `owner [ttl] [class] type rdata` form.
    pub records: Vec<String>,
}
