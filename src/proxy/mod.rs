//! L4 relay implementation.
//!
//! This module provides:
//! - PROXY protocol v1 framing (parse + format)
//! - Listener lifecycle (control, cluster range, mapped ports)
//! - The control-port routing engine and the cluster-port host engine
//! - Connection splicing with per-backend-port admission counters
//!
//! ## Architecture
//!
//! ```text
//! Peer proxy -> Listener -> PROXY v1 parse -> engine (router | host) -> dial
//!                                                       |
//!                                             counters + PROXY v1 egress
//!                                                       |
//!                                                    splice
//! ```

mod counters;
mod host;
mod listener;
mod proxy_protocol;
mod router;
mod splice;

pub use counters::{ConnectionCounters, CounterGuard};
pub use host::{HostRelay, MappedRelay};
pub use listener::{bind_listener, ClusterListener, ControlListener, ListenerRegistry};
pub use proxy_protocol::{read_framing, Framing, HeaderError, ProxyV1Header};
pub use router::Router;
pub use splice::splice;

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default per-attempt backend dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Dial a backend with a bounded wait.
pub(crate) async fn dial(host: &str, port: u16, wait: Duration) -> io::Result<TcpStream> {
    match timeout(wait, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}
