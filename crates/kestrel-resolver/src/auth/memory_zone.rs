use super::{AuthZoneConfig, FindOption, FindResult, FindResultKind, Zone, ZoneError};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use kestrel_core::message::ns_target;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

const DEFAULT_TTL: u32 = 3600;

/// Records stored at one owner name.
#[derive(Debug, Default)]
struct ZoneNode {
    rrsets: HashMap<RecordType, Vec<Record>>,
}

impl ZoneNode {
    fn add_record(&mut self, record: Record) {
        let rrset = self.rrsets.entry(record.record_type()).or_default();
        if !rrset.contains(&record) {
            rrset.push(record);
        }
    }

    fn get_rrset(&self, rtype: RecordType) -> Option<&Vec<Record>> {
        self.rrsets.get(&rtype)
    }
}

/// An in-memory zone built from configured records.
#[derive(Debug)]
pub struct MemoryZone {
    origin: Name,
    nodes: HashMap<Name, ZoneNode>,
}

impl MemoryZone {
    /// Creates an empty zone.
    pub fn new(origin: Name) -> Self {
        Self {
            origin: origin.to_lowercase(),
            nodes: HashMap::new(),
        }
    }

    /// Parses and validates a configured zone.
    pub fn from_config(config: &AuthZoneConfig) -> Result<Self, ZoneError> {
        let origin = Name::from_str(&config.origin)
            .ok()
            .filter(Name::is_fqdn)
            .ok_or_else(|| ZoneError::InvalidOrigin(config.origin.clone()))?;

        let mut zone = Self::new(origin);
        for (idx, line) in config.records.iter().enumerate() {
            let record = parse_record(line, &zone.origin).map_err(|reason| ZoneError::Parse {
                origin: config.origin.clone(),
                line: idx + 1,
                reason,
            })?;
            zone.add_record(record)?;
        }
        zone.validate()?;
        Ok(zone)
    }

    /// Adds a record owned by a name inside the zone.
    pub fn add_record(&mut self, record: Record) -> Result<(), ZoneError> {
        if !self.origin.zone_of(record.name()) {
            return Err(ZoneError::OutOfZone {
                name: record.name().clone(),
                origin: self.origin.clone(),
            });
        }
        self.nodes
            .entry(record.name().to_lowercase())
            .or_default()
            .add_record(record);
        Ok(())
    }

    fn get_records(&self, name: &Name, rtype: RecordType) -> Option<&Vec<Record>> {
        self.nodes
            .get(&name.to_lowercase())
            .and_then(|node| node.get_rrset(rtype))
    }

    /// Checks the apex SOA and NS and that CNAMEs stand alone.
    pub fn validate(&self) -> Result<(), ZoneError> {
        let invalid = |reason: String| ZoneError::Invalid {
            origin: self.origin.clone(),
            reason,
        };

        if self.get_records(&self.origin, RecordType::SOA).is_none() {
            return Err(invalid("zone missing SOA record at apex".into()));
        }
        if self.get_records(&self.origin, RecordType::NS).is_none() {
            return Err(invalid("zone missing NS records at apex".into()));
        }
        for (name, node) in &self.nodes {
            if node.rrsets.contains_key(&RecordType::CNAME) && node.rrsets.len() > 1 {
                return Err(invalid(format!("CNAME at {name} has other records")));
            }
        }
        Ok(())
    }

    /// Highest delegation point strictly between the origin and `name`.
    fn find_delegation(&self, name: &Name) -> Option<&Vec<Record>> {
        let apex_labels = usize::from(self.origin.num_labels());
        let labels = usize::from(name.num_labels());
        (apex_labels + 1..=labels).find_map(|n| self.get_records(&name.trim_to(n), RecordType::NS))
    }

    fn glue(&self, ns_rrset: &[Record]) -> Vec<Record> {
        ns_rrset
            .iter()
            .filter_map(ns_target)
            .filter(|target| self.origin.zone_of(target))
            .flat_map(|target| {
                [RecordType::A, RecordType::AAAA]
                    .into_iter()
                    .filter_map(move |t| self.get_records(target, t))
                    .flatten()
                    .cloned()
            })
            .collect()
    }

    fn has_descendants(&self, name: &Name) -> bool {
        self.nodes
            .keys()
            .any(|owner| owner.num_labels() > name.num_labels() && name.zone_of(owner))
    }
}

impl Zone for MemoryZone {
    fn origin(&self) -> &Name {
        &self.origin
    }

    fn find(&self, name: &Name, rtype: RecordType, option: FindOption) -> FindResult {
        if !self.origin.zone_of(name) {
            return FindResult::new(FindResultKind::NXDomain);
        }

        if let Some(ns) = self.find_delegation(name) {
            let mut result = FindResult::new(FindResultKind::Delegation);
            if option == FindOption::GlueOk {
                result.additional = self.glue(ns);
            }
            result.rrset = ns.clone();
            return result;
        }

        let Some(node) = self.nodes.get(&name.to_lowercase()) else {
            // Empty non-terminals exist but hold no data.
            return if self.has_descendants(name) {
                FindResult::new(FindResultKind::NXRRset)
            } else {
                FindResult::new(FindResultKind::NXDomain)
            };
        };

        if let Some(rrset) = node.get_rrset(rtype) {
            let mut result = FindResult::new(FindResultKind::Success);
            if option == FindOption::GlueOk && rtype == RecordType::NS {
                result.additional = self.glue(rrset);
            }
            result.rrset = rrset.clone();
            return result;
        }

        if let Some(cname) = node.get_rrset(RecordType::CNAME) {
            let mut result = FindResult::new(FindResultKind::CName);
            result.rrset = cname.clone();
            return result;
        }

        FindResult::new(FindResultKind::NXRRset)
    }
}

fn absolute_name(token: &str, origin: &Name) -> Result<Name, String> {
    if token == "@" {
        return Ok(origin.clone());
    }
    let name = Name::from_str(token).map_err(|e| e.to_string())?;
    if name.is_fqdn() {
        Ok(name)
    } else {
        name.append_domain(origin).map_err(|e| e.to_string())
    }
}

fn parse_u32(token: Option<&str>, what: &str) -> Result<u32, String> {
    token
        .ok_or_else(|| format!("missing {what}"))?
        .parse()
        .map_err(|_| format!("invalid {what}"))
}

fn parse_i32(token: Option<&str>, what: &str) -> Result<i32, String> {
    token
        .ok_or_else(|| format!("missing {what}"))?
        .parse()
        .map_err(|_| format!("invalid {what}"))
}

/// Parses `owner [ttl] [class] type rdata`.
fn parse_record(line: &str, origin: &Name) -> Result<Record, String> {
    let mut fields = line.split_whitespace().peekable();
    let owner = absolute_name(fields.next().ok_or("missing owner")?, origin)?;

    let mut ttl = DEFAULT_TTL;
    if let Some(value) = fields.peek().and_then(|f| f.parse::<u32>().ok()) {
        ttl = value;
        fields.next();
    }
    let mut class = DNSClass::IN;
    if let Some(value) = fields
        .peek()
        .and_then(|f| DNSClass::from_str(&f.to_ascii_uppercase()).ok())
    {
        class = value;
        fields.next();
    }

    let rtype = fields.next().ok_or("missing type")?;
    let rtype = RecordType::from_str(&rtype.to_ascii_uppercase()).map_err(|e| e.to_string())?;
    let mut name = |what: &str| -> Result<Name, String> {
        absolute_name(fields.next().ok_or_else(|| format!("missing {what}"))?, origin)
    };

    let rdata = match rtype {
        RecordType::NS => RData::NS(NS(name("nameserver")?)),
        RecordType::CNAME => RData::CNAME(CNAME(name("target")?)),
        RecordType::PTR => RData::PTR(PTR(name("target")?)),
        RecordType::A => {
            let ip = fields.next().ok_or("missing address")?;
            RData::A(A(ip.parse::<Ipv4Addr>().map_err(|e| e.to_string())?))
        }
        RecordType::AAAA => {
            let ip = fields.next().ok_or("missing address")?;
            RData::AAAA(AAAA(ip.parse::<Ipv6Addr>().map_err(|e| e.to_string())?))
        }
        RecordType::MX => {
            let preference = fields
                .next()
                .ok_or("missing preference")?
                .parse::<u16>()
                .map_err(|_| "invalid preference")?;
            let exchange = absolute_name(fields.next().ok_or("missing exchange")?, origin)?;
            RData::MX(MX::new(preference, exchange))
        }
        RecordType::TXT => {
            let text: Vec<String> = fields
                .by_ref()
                .map(|s| s.trim_matches('"').to_string())
                .collect();
            if text.is_empty() {
                return Err("missing text".into());
            }
            RData::TXT(TXT::new(text))
        }
        RecordType::SOA => {
            let mname = absolute_name(fields.next().ok_or("missing mname")?, origin)?;
            let rname = absolute_name(fields.next().ok_or("missing rname")?, origin)?;
            let serial = parse_u32(fields.next(), "serial")?;
            let refresh = parse_i32(fields.next(), "refresh")?;
            let retry = parse_i32(fields.next(), "retry")?;
            let expire = parse_i32(fields.next(), "expire")?;
            let minimum = parse_u32(fields.next(), "minimum")?;
            RData::SOA(SOA::new(mname, rname, serial, refresh, retry, expire, minimum))
        }
        other => return Err(format!("unsupported record type {other}")),
    };

    let mut record = Record::from_rdata(owner, ttl, rdata);
    record.set_dns_class(class);
    Ok(record)
}
