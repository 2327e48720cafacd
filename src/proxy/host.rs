//! Cluster-port and mapped-port engines.
//!
//! `HostRelay` serves the cluster-port range: it tries every peer host in
//! the hosts table, one dial at a time, and hands the connection to the
//! first host that accepts, always announcing a PROXY v1 line on egress.
//! `MappedRelay` serves ports from the cluster-mapping table with a plain
//! unframed relay to the first accepting out-port.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::tables::LiveTables;

use super::counters::ConnectionCounters;
use super::proxy_protocol::{read_framing, Framing, ProxyV1Header};
use super::splice::splice;
use super::{dial, DEFAULT_DIAL_TIMEOUT};

pub struct HostRelay {
    tables: Arc<LiveTables>,
    counters: Arc<ConnectionCounters>,
    dial_timeout: Duration,
}

impl HostRelay {
    pub fn new(tables: Arc<LiveTables>, counters: Arc<ConnectionCounters>) -> Self {
        Self::with_timeout(tables, counters, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_timeout(
        tables: Arc<LiveTables>,
        counters: Arc<ConnectionCounters>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            tables,
            counters,
            dial_timeout,
        }
    }

    /// Handle one accepted cluster-port connection.
    ///
    /// Dial attempts are strictly sequential for a single connection; the
    /// loop stops at the first host that accepts. When no host is reachable
    /// the client is closed without any reply.
    pub async fn handle(
        &self,
        mut client: TcpStream,
        cluster_port: u16,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let (framing, preamble) = read_framing(&mut client).await?;

        // Clients that sent no framing of their own get a loopback line
        // carrying the cluster port.
        let header = match framing {
            Framing::Framed(header) => header,
            Framing::Unframed => ProxyV1Header::synthesized(cluster_port),
        };

        let hosts = self.tables.hosts();
        if hosts.is_empty() {
            debug!(cluster_port, peer = %peer, "hosts table is empty, dropping connection");
            return Ok(());
        }

        for (ip, port) in hosts.iter() {
            let mut backend = match dial(ip, port, self.dial_timeout).await {
                Ok(backend) => backend,
                Err(e) => {
                    debug!(host = ip, port, error = %e, "host dial failed, trying next");
                    continue;
                }
            };

            debug!(host = ip, port, cluster_port, "host accepted");

            let guard = self.counters.acquire(port).await;
            backend.write_all(header.format().as_bytes()).await?;
            if !preamble.is_empty() {
                backend.write_all(&preamble).await?;
            }

            splice(client, backend, guard).await;
            return Ok(());
        }

        debug!(cluster_port, peer = %peer, "no reachable host, dropping connection");
        Ok(())
    }
}

pub struct MappedRelay {
    tables: Arc<LiveTables>,
    counters: Arc<ConnectionCounters>,
    /// Host the out-ports are dialed on.
    backend_host: String,
    dial_timeout: Duration,
}

impl MappedRelay {
    pub fn new(
        tables: Arc<LiveTables>,
        counters: Arc<ConnectionCounters>,
        backend_host: String,
    ) -> Self {
        Self::with_timeout(tables, counters, backend_host, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_timeout(
        tables: Arc<LiveTables>,
        counters: Arc<ConnectionCounters>,
        backend_host: String,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            tables,
            counters,
            backend_host,
            dial_timeout,
        }
    }

    /// Handle one accepted mapped-port connection: no framing on either
    /// side, first out-port to accept the dial gets the relay.
    pub async fn handle(
        &self,
        client: TcpStream,
        in_port: u16,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let map = self.tables.cluster();
        let out_ports = map.get(in_port).unwrap_or_default();

        for &port in out_ports {
            let backend = match dial(&self.backend_host, port, self.dial_timeout).await {
                Ok(backend) => backend,
                Err(e) => {
                    debug!(port, error = %e, "out-port dial failed, trying next");
                    continue;
                }
            };

            debug!(in_port, out_port = port, "out-port accepted");

            let guard = self.counters.acquire(port).await;
            splice(client, backend, guard).await;
            return Ok(());
        }

        debug!(in_port, peer = %peer, "no reachable out-port, dropping connection");
        Ok(())
    }
}
