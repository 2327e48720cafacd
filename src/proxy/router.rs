//! Control-port routing engine.
//!
//! One accepted connection walks a fixed path: parse the PROXY v1 header,
//! look the proxy-port up in the routing table snapshot, then try backend
//! candidates in configured order. A candidate is skipped when its
//! admission cap is reached or its dial fails; the first accepting backend
//! gets the relay. The client hears `go ahead\n` on success, `go away\n`
//! when every candidate is exhausted, and nothing at all when its header
//! was unusable.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::tables::LiveTables;

use super::counters::ConnectionCounters;
use super::proxy_protocol::{read_framing, Framing};
use super::splice::splice;
use super::{dial, DEFAULT_DIAL_TIMEOUT};

/// Reply sent before splicing starts.
pub const RESPONSE_MAPPING_ACTIVE: &[u8] = b"go ahead\n";
/// Reply sent when no backend could take the connection.
pub const RESPONSE_MAPPING_INACTIVE: &[u8] = b"go away\n";

pub struct Router {
    tables: Arc<LiveTables>,
    counters: Arc<ConnectionCounters>,
    /// Host the backend ports are dialed on.
    backend_host: String,
    dial_timeout: Duration,
}

impl Router {
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

    /// Handle one accepted control-port connection.
    pub async fn handle(&self, mut client: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let (framing, leftover) = read_framing(&mut client).await?;

        let header = match framing {
            Framing::Framed(header) => header,
            Framing::Unframed => {
                // Unusable header: close without any reply.
                debug!(peer = %peer, "rejecting connection without usable framing");
                return Ok(());
            }
        };

        let table = self.tables.routing();
        let candidates = table.lookup(header.dst_port).unwrap_or_default();
        if candidates.is_empty() {
            debug!(proxy_port = header.dst_port, "no mapping for proxy port");
            client.write_all(RESPONSE_MAPPING_INACTIVE).await?;
            return Ok(());
        }

        for candidate in candidates {
            let Some(guard) = self
                .counters
                .try_admit(candidate.host_port, candidate.max_connections)
                .await
            else {
                debug!(
                    host_port = candidate.host_port,
                    max_connections = candidate.max_connections,
                    "admission cap reached, trying next candidate"
                );
                continue;
            };

            let mut backend = match dial(&self.backend_host, candidate.host_port, self.dial_timeout)
                .await
            {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(
                        host_port = candidate.host_port,
                        error = %e,
                        "backend dial failed, trying next candidate"
                    );
                    drop(guard);
                    continue;
                }
            };

            debug!(
                proxy_port = header.dst_port,
                host_port = candidate.host_port,
                "backend accepted"
            );

            client.write_all(RESPONSE_MAPPING_ACTIVE).await?;
            if candidate.send_proxy {
                backend.write_all(header.format().as_bytes()).await?;
            }
            if !leftover.is_empty() {
                backend.write_all(&leftover).await?;
            }

            splice(client, backend, guard).await;
            return Ok(());
        }

        debug!(proxy_port = header.dst_port, "all candidates exhausted");
        client.write_all(RESPONSE_MAPPING_INACTIVE).await?;
        Ok(())
    }
}
