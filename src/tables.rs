//! Routing-table types and the three configuration-file loaders.
//!
//! Each loader is pure: read the file, parse it, hand back a freshly built
//! table. Live publication is a single atomic pointer swap; readers capture
//! a snapshot at connection entry and keep it for the connection's lifetime,
//! so a reload never tears down an established relay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{info, warn};

/// Trailing line that marks a ports-configuration file as fully written.
pub const EOF_SENTINEL: &str = "### EOF\n";

/// Errors surfaced by the table loaders.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The ports file does not end with the EOF sentinel; the writer is not
    /// done and the previous table must be kept.
    #[error("ports configuration is missing its EOF sentinel (file still being written)")]
    NotReady,

    #[error("invalid configuration line `{line}`: {reason}")]
    Parse { line: String, reason: String },
}

impl TableError {
    fn parse(line: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// One backend candidate for a proxy-port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEntry {
    pub host_port: u16,
    pub max_connections: u32,
    pub send_proxy: bool,
}

/// Proxy-port to ordered backend candidates (control-listener lookups).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    entries: HashMap<u16, Vec<BackendEntry>>,
}

impl RoutingTable {
    pub fn lookup(&self, proxy_port: u16) -> Option<&[BackendEntry]> {
        self.entries.get(&proxy_port).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mapped in-port to out-ports (legacy forwarder and the listener diff).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    map: HashMap<u16, Vec<u16>>,
}

impl ClusterMap {
    pub fn get(&self, in_port: u16) -> Option<&[u16]> {
        self.map.get(&in_port).map(Vec::as_slice)
    }

    pub fn contains(&self, in_port: u16) -> bool {
        self.map.contains_key(&in_port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.map.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Peer-proxy address to port. Iteration order is unspecified; the host-role
/// loop only needs each entry visited at most once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostsTable {
    hosts: HashMap<String, u16>,
}

impl HostsTable {
    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> + '_ {
        self.hosts.iter().map(|(ip, port)| (ip.as_str(), *port))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Parse cluster-mapping content: `inPort:[outPortA,outPortB,...]` per line.
pub fn parse_cluster_map(contents: &str) -> Result<ClusterMap, TableError> {
    let mut map: HashMap<u16, Vec<u16>> = HashMap::new();

    for line in contents.lines() {
        let halves: Vec<&str> = line.split(':').collect();
        if halves.len() != 2 {
            return Err(TableError::parse(
                line,
                "expected format inPort:[outPortA,outPortB,...]",
            ));
        }

        let in_port = parse_port_token(line, halves[0])?;

        let inner = bracketed(halves[1]).ok_or_else(|| {
            TableError::parse(line, "expected bracketed out-port list")
        })?;
        let out_ports = inner
            .split(',')
            .map(|token| parse_port_token(line, token))
            .collect::<Result<Vec<u16>, TableError>>()?;

        if map.insert(in_port, out_ports).is_some() {
            warn!(in_port, "duplicate cluster-mapping entry, last one wins");
        }
    }

    Ok(ClusterMap { map })
}

/// Parse ports-configuration content.
///
/// Entries are `clusterPort:hostPort:maxConnections:sendProxyFlag`, several
/// per line separated by single spaces; a line's entries must agree on the
/// cluster port. The file must end with the EOF sentinel.
pub fn parse_ports_table(contents: &str) -> Result<RoutingTable, TableError> {
    if !contents.ends_with(EOF_SENTINEL) {
        return Err(TableError::NotReady);
    }

    let mut entries: HashMap<u16, Vec<BackendEntry>> = HashMap::new();

    for line in contents.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut cluster_port: Option<u16> = None;
        let mut backends = Vec::new();

        for entry in line.split(' ') {
            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() != 4 {
                return Err(TableError::parse(
                    line,
                    "expected format clusterPort:hostPort:maxConnections:sendProxyFlag",
                ));
            }

            let entry_cluster_port = parse_port_token(line, fields[0])?;
            match cluster_port {
                None => cluster_port = Some(entry_cluster_port),
                Some(expected) if expected != entry_cluster_port => {
                    return Err(TableError::parse(
                        line,
                        "entries on one line disagree on clusterPort",
                    ));
                }
                Some(_) => {}
            }

            backends.push(BackendEntry {
                host_port: parse_port_token(line, fields[1])?,
                max_connections: fields[2].parse().map_err(|_| {
                    TableError::parse(line, format!("invalid maxConnections `{}`", fields[2]))
                })?,
                send_proxy: parse_flag(line, fields[3])?,
            });
        }

        if let Some(cluster_port) = cluster_port {
            entries.insert(cluster_port, backends);
        }
    }

    Ok(RoutingTable { entries })
}

/// Parse hosts content: `ip:port` per line. The address is kept verbatim and
/// only validated when used as a dial target.
pub fn parse_hosts_table(contents: &str) -> Result<HostsTable, TableError> {
    let mut hosts = HashMap::new();

    for line in contents.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 2 {
            return Err(TableError::parse(line, "expected format ip:port"));
        }

        let port = parse_port_token(line, fields[1])?;
        hosts.insert(fields[0].to_string(), port);
    }

    Ok(HostsTable { hosts })
}

pub fn load_cluster_map(path: &Path) -> Result<ClusterMap, TableError> {
    parse_cluster_map(&read_file(path)?)
}

pub fn load_ports_table(path: &Path) -> Result<RoutingTable, TableError> {
    parse_ports_table(&read_file(path)?)
}

pub fn load_hosts_table(path: &Path) -> Result<HostsTable, TableError> {
    parse_hosts_table(&read_file(path)?)
}

fn read_file(path: &Path) -> Result<String, TableError> {
    std::fs::read_to_string(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_port_token(line: &str, token: &str) -> Result<u16, TableError> {
    token
        .parse()
        .map_err(|_| TableError::parse(line, format!("invalid port `{token}`")))
}

fn parse_flag(line: &str, token: &str) -> Result<bool, TableError> {
    match token {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(TableError::parse(
            line,
            format!("invalid sendProxyFlag `{token}`"),
        )),
    }
}

fn bracketed(field: &str) -> Option<&str> {
    let start = field.find('[')?;
    let rest = &field[start + 1..];
    let end = rest.find(']')?;
    Some(&rest[..end])
}

/// The live tables, published behind atomically swappable handles.
///
/// Writers replace a whole table in a single pointer store; readers load a
/// consistent snapshot without blocking and hold it for one connection.
pub struct LiveTables {
    routing: ArcSwap<RoutingTable>,
    hosts: ArcSwap<HostsTable>,
    cluster: ArcSwap<ClusterMap>,
}

impl LiveTables {
    pub fn new(routing: RoutingTable, hosts: HostsTable, cluster: ClusterMap) -> Self {
        Self {
            routing: ArcSwap::from_pointee(routing),
            hosts: ArcSwap::from_pointee(hosts),
            cluster: ArcSwap::from_pointee(cluster),
        }
    }

    pub fn routing(&self) -> Arc<RoutingTable> {
        self.routing.load_full()
    }

    pub fn hosts(&self) -> Arc<HostsTable> {
        self.hosts.load_full()
    }

    pub fn cluster(&self) -> Arc<ClusterMap> {
        self.cluster.load_full()
    }

    pub fn publish_routing(&self, table: RoutingTable) {
        info!(proxy_ports = table.len(), "ports configuration published");
        self.routing.store(Arc::new(table));
    }

    pub fn publish_hosts(&self, table: HostsTable) {
        info!(hosts = table.len(), "hosts configuration published");
        self.hosts.store(Arc::new(table));
    }

    pub fn publish_cluster(&self, table: ClusterMap) {
        info!(mapped_ports = table.len(), "cluster mapping published");
        self.cluster.store(Arc::new(table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_map() {
        let map = parse_cluster_map("28080:[8080,8081]\n28090:[9090]\n").unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(28080), Some(&[8080, 8081][..]));
        assert_eq!(map.get(28090), Some(&[9090][..]));
        assert!(!map.contains(28000));
    }

    #[test]
    fn test_parse_cluster_map_duplicate_last_wins() {
        let map = parse_cluster_map("28080:[8080]\n28080:[9090]\n").unwrap();
        assert_eq!(map.get(28080), Some(&[9090][..]));
    }

    #[test]
    fn test_parse_cluster_map_rejects_missing_brackets() {
        assert!(parse_cluster_map("28080:8080,8081\n").is_err());
    }

    #[test]
    fn test_parse_cluster_map_rejects_empty_list() {
        assert!(parse_cluster_map("28080:[]\n").is_err());
    }

    #[test]
    fn test_parse_cluster_map_rejects_extra_colon() {
        assert!(parse_cluster_map("28080:[8080]:junk\n").is_err());
    }

    #[test]
    fn test_parse_ports_table() {
        let table =
            parse_ports_table("8080:9000:100:false 8080:9001:10:true\n### EOF\n").unwrap();

        let backends = table.lookup(8080).unwrap();
        assert_eq!(
            backends,
            &[
                BackendEntry {
                    host_port: 9000,
                    max_connections: 100,
                    send_proxy: false,
                },
                BackendEntry {
                    host_port: 9001,
                    max_connections: 10,
                    send_proxy: true,
                },
            ]
        );
    }

    #[test]
    fn test_parse_ports_table_requires_sentinel() {
        match parse_ports_table("8080:9000:100:false\n") {
            Err(TableError::NotReady) => {}
            other => panic!("expected NotReady, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ports_table_sentinel_only_is_empty() {
        let table = parse_ports_table("### EOF\n").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_ports_table_skips_comment_lines() {
        let table = parse_ports_table("#8080:9000:100:false\n### EOF\n").unwrap();
        assert!(table.lookup(8080).is_none());
    }

    #[test]
    fn test_parse_ports_table_rejects_mixed_cluster_ports() {
        let err =
            parse_ports_table("8080:9000:100:false 8081:9001:100:false\n### EOF\n").unwrap_err();
        match err {
            TableError::Parse { reason, .. } => {
                assert!(reason.contains("disagree"), "unexpected reason: {reason}")
            }
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ports_table_flag_spellings() {
        let table = parse_ports_table("1:2:3:t\n4:5:6:0\n### EOF\n").unwrap();
        assert!(table.lookup(1).unwrap()[0].send_proxy);
        assert!(!table.lookup(4).unwrap()[0].send_proxy);

        assert!(parse_ports_table("1:2:3:yes\n### EOF\n").is_err());
    }

    #[test]
    fn test_parse_hosts_table() {
        let table = parse_hosts_table("192.168.10.20:32767\n192.168.10.30:32767\n").unwrap();

        assert_eq!(table.len(), 2);
        let mut hosts: Vec<(&str, u16)> = table.iter().collect();
        hosts.sort();
        assert_eq!(
            hosts,
            vec![("192.168.10.20", 32767), ("192.168.10.30", 32767)]
        );
    }

    #[test]
    fn test_parse_hosts_table_rejects_bad_port() {
        assert!(parse_hosts_table("192.168.10.20:notaport\n").is_err());
    }

    #[test]
    fn test_identical_content_parses_to_equal_tables() {
        let contents = "8080:9000:100:false\n### EOF\n";
        assert_eq!(
            parse_ports_table(contents).unwrap(),
            parse_ports_table(contents).unwrap()
        );
    }

    #[test]
    fn test_live_tables_swap() {
        let live = LiveTables::new(
            RoutingTable::default(),
            HostsTable::default(),
            ClusterMap::default(),
        );

        let before = live.routing();
        assert!(before.is_empty());

        live.publish_routing(parse_ports_table("8080:9000:1:false\n### EOF\n").unwrap());

        // The earlier snapshot is untouched; new loads see the swap.
        assert!(before.is_empty());
        assert!(live.routing().lookup(8080).is_some());
    }
}
