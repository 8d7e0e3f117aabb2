//! Root server hints.
//!
//! Hint files hold one record per line in the form
//! `owner [ttl] [class] type rdata`. Only root-owned NS records and A records
//! are accepted; every A record becomes a root nameserver whose initial RTT is
//! the record TTL in seconds.

use crate::nsas::NameServer;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Root hint error.
#[derive(Error, Debug)]
pub enum RootHintError {
    #[error("Root hint NS records must be owned by the root zone")]
    InvalidRootHintZone,

    #[error("Only NS and A records are allowed in root hints, got {0}")]
    UnsupportedRootHintType(RecordType),

    #[error("Invalid root hint at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Failed to read root hint file: {0}")]
    Io(#[from] std::io::Error),
}

/// IANA root servers (IPv4).
pub static ROOT_HINTS: &[(&str, Ipv4Addr)] = &[
    ("a.root-servers.net.", Ipv4Addr::new(198, 41, 0, 4)),
    ("b.root-servers.net.", Ipv4Addr::new(199, 9, 14, 201)),
    ("c.root-servers.net.", Ipv4Addr::new(192, 33, 4, 12)),
    ("d.root-servers.net.", Ipv4Addr::new(199, 7, 91, 13)),
    ("e.root-servers.net.", Ipv4Addr::new(192, 203, 230, 10)),
    ("f.root-servers.net.", Ipv4Addr::new(192, 5, 5, 241)),
    ("g.root-servers.net.", Ipv4Addr::new(192, 112, 36, 4)),
    ("h.root-servers.net.", Ipv4Addr::new(198, 97, 190, 53)),
    ("i.root-servers.net.", Ipv4Addr::new(192, 36, 148, 17)),
    ("j.root-servers.net.", Ipv4Addr::new(192, 58, 128, 30)),
    ("k.root-servers.net.", Ipv4Addr::new(193, 0, 14, 129)),
    ("l.root-servers.net.", Ipv4Addr::new(199, 7, 83, 42)),
    ("m.root-servers.net.", Ipv4Addr::new(202, 12, 27, 33)),
];

/// The built-in root servers.
pub fn builtin_root_servers() -> Vec<NameServer> {
    ROOT_HINTS
        .iter()
        .filter_map(|(name, ip)| {
            Some(NameServer {
                zone: Name::root(),
                name: Name::from_str(name).ok()?,
                addr: SocketAddr::new(IpAddr::V4(*ip), 53),
                rtt: Duration::ZERO,
            })
        })
        .collect()
}

/// Reads and parses a root hint file.
pub fn load_root_hint_file(path: &Path) -> Result<Vec<NameServer>, RootHintError> {
    let content = std::fs::read_to_string(path)?;
    parse_root_hint(&content)
}

/// Parses root hint text.
pub fn parse_root_hint(content: &str) -> Result<Vec<NameServer>, RootHintError> {
    let mut servers = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        let parse_err = |reason: &str| RootHintError::Parse {
            line: idx + 1,
            reason: reason.to_string(),
        };

        let mut fields = line.split_whitespace().peekable();
        let owner = fields.next().ok_or_else(|| parse_err("missing owner"))?;
        let owner = Name::from_str(owner).map_err(|e| parse_err(&e.to_string()))?;

        let mut ttl = 0u32;
        if let Some(value) = fields.peek().and_then(|f| f.parse::<u32>().ok()) {
            ttl = value;
            fields.next();
        }
        if fields
            .peek()
            .is_some_and(|f| DNSClass::from_str(&f.to_ascii_uppercase()).is_ok())
        {
            fields.next();
        }

        let rtype = fields.next().ok_or_else(|| parse_err("missing type"))?;
        let rtype = RecordType::from_str(&rtype.to_ascii_uppercase())
            .map_err(|e| parse_err(&e.to_string()))?;
        let rdata = fields.next().ok_or_else(|| parse_err("missing rdata"))?;

        match rtype {
            RecordType::NS => {
                if !owner.is_root() {
                    return Err(RootHintError::InvalidRootHintZone);
                }
                Name::from_str(rdata).map_err(|e| parse_err(&e.to_string()))?;
            }
            RecordType::A => {
                let ip = rdata
                    .parse::<Ipv4Addr>()
                    .map_err(|e| parse_err(&e.to_string()))?;
                servers.push(NameServer {
                    zone: Name::root(),
                    name: owner,
                    addr: SocketAddr::new(IpAddr::V4(ip), 53),
                    rtt: Duration::from_secs(u64::from(ttl)),
                });
            }
            other => return Err(RootHintError::UnsupportedRootHintType(other)),
        }
    }

    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HINTS: &str = "\
.                        3600000      NS    A.ROOT-SERVERS.NET.
A.ROOT-SERVERS.NET.      3600000      A     198.41.0.4

.                        3600000 IN   NS    B.ROOT-SERVERS.NET.
B.ROOT-SERVERS.NET.      3600000 IN   A     199.9.14.201
";

    #[test]
    fn test_parse_hints() {
        let servers = parse_root_hint(HINTS).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, Name::from_str("a.root-servers.net.").unwrap());
        assert_eq!(servers[0].addr, "198.41.0.4:53".parse().unwrap());
        assert_eq!(servers[0].rtt, Duration::from_secs(3600000));
        assert!(servers[1].zone.is_root());
    }

    #[test]
    fn test_rejects_bad_hints() {
        assert!(matches!(
            parse_root_hint("com. 3600 NS a.gtld-servers.net."),
            Err(RootHintError::InvalidRootHintZone)
        ));
        assert!(matches!(
            parse_root_hint("a.root-servers.net. 3600 AAAA 2001:503:ba3e::2:30"),
            Err(RootHintError::UnsupportedRootHintType(RecordType::AAAA))
        ));
        assert!(matches!(
            parse_root_hint("a.root-servers.net. 3600 A"),
            Err(RootHintError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            parse_root_hint("\na.root-servers.net. 3600 A not-an-ip"),
            Err(RootHintError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(HINTS.as_bytes()).unwrap();
        assert_eq!(load_root_hint_file(file.path()).unwrap().len(), 2);

        assert!(matches!(
            load_root_hint_file(Path::new("/nonexistent/root.hint")),
            Err(RootHintError::Io(_))
        ));
    }

    #[test]
    fn test_builtin_root_servers() {
        let roots = builtin_root_servers();
        assert_eq!(roots.len(), 13);
        assert!(roots.iter().all(|r| r.zone.is_root() && r.addr.port() == 53));
    }
}
