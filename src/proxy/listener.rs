//! Listener lifecycle.
//!
//! The control listener and the cluster-port range are bound once at
//! startup. Mapped-port listeners are owned by a registry that is
//! reconciled against the cluster-mapping table on each reload: listeners
//! whose port disappeared or whose out-port list changed are closed,
//! missing ones are bound. Closing a listener never touches established
//! relays.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::tables::ClusterMap;

use super::host::{HostRelay, MappedRelay};
use super::router::Router;

/// Bind a TCP listener; an empty host means all interfaces.
pub async fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else {
        format!("{host}:{port}")
    };
    TcpListener::bind(addr.as_str()).await
}

fn spawn_connection<F>(role: &'static str, peer: SocketAddr, handler: F)
where
    F: std::future::Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(e) = handler.await {
                debug!(error = %e, "connection error");
            }
        }
        .instrument(info_span!("connection", role, peer = %peer)),
    );
}

async fn pause_after_accept_error(e: io::Error) {
    error!(error = %e, "accept error");
    // Avoid a tight loop on persistent accept failures.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// The control-port listener feeding the routing engine.
pub struct ControlListener {
    listener: TcpListener,
    router: Arc<Router>,
}

impl ControlListener {
    pub async fn bind(host: &str, port: u16, router: Arc<Router>) -> io::Result<Self> {
        let listener = bind_listener(host, port).await?;
        info!(bind_addr = %listener.local_addr()?, "control listener bound");
        Ok(Self { listener, router })
    }

    pub fn new(listener: TcpListener, router: Arc<Router>) -> Self {
        Self { listener, router }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let router = Arc::clone(&self.router);
                    spawn_connection("control", peer, async move {
                        router.handle(stream, peer).await
                    });
                }
                Err(e) => pause_after_accept_error(e).await,
            }
        }
    }
}

/// One listener of the cluster-port range feeding the host engine.
pub struct ClusterListener {
    listener: TcpListener,
    relay: Arc<HostRelay>,
    cluster_port: u16,
}

impl ClusterListener {
    pub async fn bind(host: &str, port: u16, relay: Arc<HostRelay>) -> io::Result<Self> {
        let listener = bind_listener(host, port).await?;
        debug!(bind_addr = %listener.local_addr()?, "cluster listener bound");
        Ok(Self {
            listener,
            relay,
            cluster_port: port,
        })
    }

    pub fn new(listener: TcpListener, cluster_port: u16, relay: Arc<HostRelay>) -> Self {
        Self {
            listener,
            relay,
            cluster_port,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        let cluster_port = self.cluster_port;
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let relay = Arc::clone(&self.relay);
                    spawn_connection("cluster", peer, async move {
                        relay.handle(stream, cluster_port, peer).await
                    });
                }
                Err(e) => pause_after_accept_error(e).await,
            }
        }
    }
}

/// Mapped-port listeners, keyed by port.
///
/// Mutated only from startup and the reload path; each accept loop holds
/// its listener for its lifetime and is aborted to close it.
pub struct ListenerRegistry {
    bind_host: String,
    relay: Arc<MappedRelay>,
    listeners: HashMap<u16, JoinHandle<()>>,
}

impl ListenerRegistry {
    pub fn new(bind_host: String, relay: Arc<MappedRelay>) -> Self {
        Self {
            bind_host,
            relay,
            listeners: HashMap::new(),
        }
    }

    /// Ports currently listened on.
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.keys().copied().collect()
    }

    /// Align the listener set with the next cluster-mapping table.
    ///
    /// Returns the ports that failed to bind; everything that bound stays
    /// bound, so a partial failure leaves a consistent registry.
    pub async fn reconcile(
        &mut self,
        previous: &ClusterMap,
        next: &ClusterMap,
    ) -> Vec<(u16, io::Error)> {
        let stale: Vec<u16> = self
            .listeners
            .keys()
            .copied()
            .filter(|&port| match next.get(port) {
                None => true,
                Some(next_ports) => match previous.get(port) {
                    Some(previous_ports) => !same_mapping(previous_ports, next_ports),
                    None => false,
                },
            })
            .collect();

        for port in stale {
            info!(port, "mapped-port listener removed or changed, shutting it down");
            if let Some(task) = self.listeners.remove(&port) {
                task.abort();
                // The port is only free again once the aborted loop has
                // dropped its listener.
                let _ = task.await;
            }
        }

        let mut failures = Vec::new();
        for port in next.ports() {
            if self.listeners.contains_key(&port) {
                continue;
            }

            match bind_listener(&self.bind_host, port).await {
                Ok(listener) => {
                    info!(port, "mapped-port listener bound");
                    let relay = Arc::clone(&self.relay);
                    let task = tokio::spawn(run_mapped_listener(listener, port, relay));
                    self.listeners.insert(port, task);
                }
                Err(e) => {
                    warn!(port, error = %e, "failed to bind mapped-port listener");
                    failures.push((port, e));
                }
            }
        }

        failures
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        for task in self.listeners.values() {
            task.abort();
        }
    }
}

async fn run_mapped_listener(listener: TcpListener, in_port: u16, relay: Arc<MappedRelay>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let relay = Arc::clone(&relay);
                spawn_connection("mapped", peer, async move {
                    relay.handle(stream, in_port, peer).await
                });
            }
            Err(e) => pause_after_accept_error(e).await,
        }
    }
}

/// Out-port lists compare as sets: a different length or a missing element
/// means the mapping changed.
fn same_mapping(previous: &[u16], next: &[u16]) -> bool {
    previous.len() == next.len() && previous.iter().all(|port| next.contains(port))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::tables::{parse_cluster_map, ClusterMap, HostsTable, LiveTables, RoutingTable};

    use super::super::counters::ConnectionCounters;
    use super::*;

    fn empty_tables() -> Arc<LiveTables> {
        Arc::new(LiveTables::new(
            RoutingTable::default(),
            HostsTable::default(),
            ClusterMap::default(),
        ))
    }

    fn registry() -> ListenerRegistry {
        let relay = Arc::new(MappedRelay::new(
            empty_tables(),
            Arc::new(ConnectionCounters::new()),
            "127.0.0.1".to_string(),
        ));
        ListenerRegistry::new("127.0.0.1".to_string(), relay)
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_same_mapping_ignores_order() {
        assert!(same_mapping(&[1, 2, 3], &[3, 1, 2]));
        assert!(!same_mapping(&[1, 2], &[1, 2, 3]));
        assert!(!same_mapping(&[1, 2], &[1, 4]));
        assert!(same_mapping(&[], &[]));
    }

    #[tokio::test]
    async fn test_reconcile_binds_and_removes() {
        let mut registry = registry();
        let port = free_port();

        let initial = parse_cluster_map(&format!("{port}:[9000]\n")).unwrap();
        let failures = registry.reconcile(&ClusterMap::default(), &initial).await;
        assert!(failures.is_empty());
        assert_eq!(registry.ports(), vec![port]);

        let failures = registry.reconcile(&initial, &ClusterMap::default()).await;
        assert!(failures.is_empty());
        assert!(registry.ports().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_identical_table_is_a_no_op() {
        let mut registry = registry();
        let port = free_port();

        let table = parse_cluster_map(&format!("{port}:[9000,9001]\n")).unwrap();
        registry.reconcile(&ClusterMap::default(), &table).await;

        // Same mapping (even reordered) must not disturb the listener.
        let reordered = parse_cluster_map(&format!("{port}:[9001,9000]\n")).unwrap();
        let failures = registry.reconcile(&table, &reordered).await;
        assert!(failures.is_empty());
        assert_eq!(registry.ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_reconcile_rebinds_on_changed_mapping() {
        let mut registry = registry();
        let port = free_port();

        let before = parse_cluster_map(&format!("{port}:[9000]\n")).unwrap();
        registry.reconcile(&ClusterMap::default(), &before).await;

        let after = parse_cluster_map(&format!("{port}:[9000,9001]\n")).unwrap();
        let failures = registry.reconcile(&before, &after).await;
        assert!(failures.is_empty());
        assert_eq!(registry.ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_reconcile_reports_bind_failures() {
        let mut registry = registry();

        // Occupy a port so the registry cannot bind it.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let table = parse_cluster_map(&format!("{port}:[9000]\n")).unwrap();
        let failures = registry.reconcile(&ClusterMap::default(), &table).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, port);
        assert!(registry.ports().is_empty());
    }
}
