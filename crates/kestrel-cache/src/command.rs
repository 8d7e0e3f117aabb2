//! Administrative commands over the message caches.

use hickory_proto::rr::{Name, RecordType};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use super::message_cache::MessageCache;
use super::Cache;

/// Record types the admin commands operate on.
pub const SUPPORTED_RR_TYPES: [RecordType; 10] = [
    RecordType::A,
    RecordType::AAAA,
    RecordType::CNAME,
    RecordType::NS,
    RecordType::SOA,
    RecordType::MX,
    RecordType::TXT,
    RecordType::PTR,
    RecordType::SRV,
    RecordType::CAA,
];

/// A cache administration command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum CacheCommand {
    #[serde(rename = "clean_cache")]
    CleanCache,

    #[serde(rename = "clean_view_cache")]
    CleanViewCache {
        #[serde(rename = "view_name")]
        view: String,
    },

    #[serde(rename = "clean_rrsets_cache")]
    CleanRRsetsCache {
        #[serde(rename = "view_name")]
        view: String,
        #[serde(rename = "domain_name")]
        name: String,
    },

    #[serde(rename = "clean_domain_cache")]
    CleanDomainCache {
        #[serde(rename = "domain_name")]
        name: String,
    },

    #[serde(rename = "get_domain_cache")]
    GetDomainCache {
        #[serde(rename = "domain_name")]
        name: String,
        #[serde(rename = "type")]
        rtype: String,
    },

    #[serde(rename = "get_message_cache")]
    GetMessageCache {
        #[serde(rename = "view_name")]
        view: String,
        #[serde(rename = "domain_name")]
        name: String,
        #[serde(rename = "type")]
        rtype: String,
    },
}

/// One cached record, as reported by the read-back commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRInCache {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub class: String,
    pub ttl: u32,
    pub rdata: String,
}

/// Command result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Done,
    Records(Vec<RRInCache>),
}

/// Command errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("invalid domain name: {0}")]
    InvalidName(String),

    #[error("unknown rr type: {0}")]
    UnknownRRType(String),
}

impl Cache {
    /// Executes an administrative command.
    pub fn execute(&self, command: CacheCommand) -> Result<CommandOutput, CommandError> {
        match command {
            CacheCommand::CleanCache => {
                for cache in self.caches().values() {
                    cache.clear();
                }
                Ok(CommandOutput::Done)
            }
            CacheCommand::CleanViewCache { view } => {
                self.view_cache(&view)
                    .ok_or(CommandError::UnknownView(view))?
                    .clear();
                Ok(CommandOutput::Done)
            }
            CacheCommand::CleanRRsetsCache { view, name } => {
                let name = parse_name(&name)?;
                let cache = self
                    .view_cache(&view)
                    .ok_or(CommandError::UnknownView(view))?;
                remove_all_types(&cache, &name);
                Ok(CommandOutput::Done)
            }
            CacheCommand::CleanDomainCache { name } => {
                let name = parse_name(&name)?;
                for cache in self.caches().values() {
                    remove_all_types(cache, &name);
                }
                Ok(CommandOutput::Done)
            }
            CacheCommand::GetDomainCache { name, rtype } => {
                let types = parse_types(&rtype)?;
                let name = parse_name(&name)?;
                let mut records = Vec::new();
                for cache in self.caches().values() {
                    records.extend(read_back(cache, &name, &types));
                }
                Ok(CommandOutput::Records(records))
            }
            CacheCommand::GetMessageCache { view, name, rtype } => {
                let types = parse_types(&rtype)?;
                let name = parse_name(&name)?;
                let records = self
                    .view_cache(&view)
                    .map(|cache| read_back(&cache, &name, &types))
                    .unwrap_or_default();
                Ok(CommandOutput::Records(records))
            }
        }
    }
}

fn parse_name(name: &str) -> Result<Name, CommandError> {
    let fqdn = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    };
    Name::from_str(&fqdn).map_err(|e| CommandError::InvalidName(format!("{name}: {e}")))
}

fn parse_types(rtype: &str) -> Result<Vec<RecordType>, CommandError> {
    let parsed = RecordType::from_str(&rtype.to_ascii_uppercase())
        .map_err(|_| CommandError::UnknownRRType(rtype.to_string()))?;
    match parsed {
        RecordType::ANY => Ok(SUPPORTED_RR_TYPES.to_vec()),
        RecordType::Unknown(_) => Err(CommandError::UnknownRRType(rtype.to_string())),
        other => Ok(vec![other]),
    }
}

fn remove_all_types(cache: &MessageCache, name: &Name) {
    for rtype in SUPPORTED_RR_TYPES {
        cache.remove(name, rtype);
    }
}

fn read_back(cache: &MessageCache, name: &Name, types: &[RecordType]) -> Vec<RRInCache> {
    let owner = name.to_string();
    let mut rows = Vec::new();
    for &rtype in types {
        let Some(message) = cache.get_single_message(name, rtype) else {
            continue;
        };
        for record in message.answers() {
            rows.push(RRInCache {
                name: owner.clone(),
                rtype: record.record_type().to_string(),
                class: record.dns_class().to_string(),
                ttl: record.ttl(),
                rdata: record.data().map(|d| d.to_string()).unwrap_or_default(),
            });
        }
    }
    rows
}
