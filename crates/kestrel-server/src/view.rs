//! Mapping of client addresses to views.

use ipnet::IpNet;
use kestrel_core::DEFAULT_VIEW;
use std::net::IpAddr;

/// Picks the first view whose networks contain the client.
#[derive(Debug, Clone, Default)]
pub struct ViewSelector {
    views: Vec<(String, Vec<IpNet>)>,
}

impl ViewSelector {
    pub fn new(views: Vec<(String, Vec<IpNet>)>) -> Self {
        Self { views }
    }

    /// The client's view, `default` when nothing matches.
    pub fn select(&self, ip: IpAddr) -> &str {
        self.views
            .iter()
            .find(|(_, nets)| nets.iter().any(|net| net.contains(&ip)))
            .map_or(DEFAULT_VIEW, |(name, _)| name.as_str())
    }
}
