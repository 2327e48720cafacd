pub mod proxy;
pub mod reload;
pub mod settings;
pub mod tables;

pub use proxy::{
    bind_listener, read_framing, splice, ClusterListener, ConnectionCounters, ControlListener,
    CounterGuard, Framing, HeaderError, HostRelay, ListenerRegistry, MappedRelay, ProxyV1Header,
    Router, DEFAULT_DIAL_TIMEOUT,
};
pub use tables::{
    load_cluster_map, load_hosts_table, load_ports_table, parse_cluster_map, parse_hosts_table,
    parse_ports_table, BackendEntry, ClusterMap, HostsTable, LiveTables, RoutingTable, TableError,
};
