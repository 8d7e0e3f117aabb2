//! Translation of the file configuration into stage settings.

use kestrel_cache::CacheConfig;
use kestrel_config::{Config, ForwardZoneKind};
use kestrel_resolver::{
    AuthConfig, AuthZoneConfig, ForwardZoneConfig, ForwarderConfig, RecursorConfig,
    RecursorViewConfig, ResolverSettings, StubConfig, StubZoneConfig, ZoneMatch,
};
use kestrel_server::ViewSelector;
use std::collections::HashMap;

/// Message cache settings.
pub fn cache_config(config: &Config) -> CacheConfig {
    CacheConfig {
        positive_ttl: config.cache.positive_ttl,
        negative_ttl: config.cache.negative_ttl,
        max_cache_size: config.cache.max_cache_size,
        short_answer: config.cache.short_answer,
        prefetch: config.cache.prefetch,
    }
}

/// Client address to view mapping, in configuration order.
pub fn view_selector(config: &Config) -> ViewSelector {
    ViewSelector::new(
        config
            .views
            .iter()
            .map(|v| (v.name.clone(), v.match_clients.clone()))
            .collect(),
    )
}

/// Resolver settings. Views without a `recursor` entry recurse with the
/// built-in root servers.
pub fn resolver_settings(config: &Config) -> ResolverSettings {
    let mut recursor_views: HashMap<String, RecursorViewConfig> = config
        .view_names()
        .into_iter()
        .map(|view| {
            (
                view,
                RecursorViewConfig {
                    enable: true,
                    ..Default::default()
                },
            )
        })
        .collect();
    for r in &config.recursor {
        recursor_views.insert(
            r.view.clone(),
            RecursorViewConfig {
                enable: r.enable,
                edns_subnet_enable: r.edns_subnet_enable,
                root_hint_file: r.root_hint_file.clone(),
            },
        );
    }

    let mut forward_views: HashMap<String, Vec<ForwardZoneConfig>> = HashMap::new();
    for view in &config.forwarder.views {
        forward_views
            .entry(view.view.clone())
            .or_default()
            .extend(view.zones.iter().map(|z| ForwardZoneConfig {
                zone: z.zone.clone(),
                servers: z.servers.clone(),
                kind: match z.kind {
                    ForwardZoneKind::Subdomain => ZoneMatch::Subdomain,
                    ForwardZoneKind::Exact => ZoneMatch::Exact,
                    ForwardZoneKind::Exception => ZoneMatch::Exception,
                },
            }));
    }

    let mut stub_views: HashMap<String, Vec<StubZoneConfig>> = HashMap::new();
    for view in &config.stub {
        stub_views
            .entry(view.view.clone())
            .or_default()
            .extend(view.zones.iter().map(|z| StubZoneConfig {
                zone: z.zone.clone(),
                masters: z.masters.clone(),
            }));
    }

    let mut auth_views: HashMap<String, Vec<AuthZoneConfig>> = HashMap::new();
    for view in &config.auth {
        auth_views
            .entry(view.view.clone())
            .or_default()
            .extend(view.zones.iter().map(|z| AuthZoneConfig {
                origin: z.origin.clone(),
                records: z.records.clone(),
            }));
    }

    ResolverSettings {
        check_cname_indirect: config.resolver.check_cname_indirect,
        handler_count: config.server.handler_count,
        query_sources: config
            .query_source
            .iter()
            .map(|s| (s.view.clone(), s.address))
            .collect(),
        auth: AuthConfig { views: auth_views },
        forwarder: ForwarderConfig {
            views: forward_views,
            timeout: config.forwarder.timeout(),
            retries: config.forwarder.retries,
            probe_interval: config.forwarder.probe_interval(),
        },
        stub: StubConfig { views: stub_views },
        recursor: RecursorConfig {
            views: recursor_views,
            max_zones: config.resolver.nsas_max_zones,
        },
    }
}
