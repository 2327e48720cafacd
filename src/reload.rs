//! Hot-swap reload controller.
//!
//! The ports and hosts files are polled with `stat` on a fixed cadence; a
//! change in modification time or size triggers a reload of that file. The
//! cluster-mapping file reloads only on SIGHUP, which also reconciles the
//! mapped-port listener set. A reload never aborts the process: a file that
//! fails to parse, or a ports file caught mid-write, is logged and the
//! previously published table stays live.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::proxy::ListenerRegistry;
use crate::tables::{load_cluster_map, load_hosts_table, load_ports_table, LiveTables, TableError};

/// Cadence of the file-change polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn spawn_ports_watcher(path: PathBuf, tables: Arc<LiveTables>) -> JoinHandle<()> {
    spawn_ports_watcher_with_interval(path, tables, DEFAULT_POLL_INTERVAL)
}

pub fn spawn_ports_watcher_with_interval(
    path: PathBuf,
    tables: Arc<LiveTables>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        watch_file(&path, interval, || {
            info!(path = %path.display(), "ports configuration changed, reloading");
            match load_ports_table(&path) {
                Ok(table) => tables.publish_routing(table),
                Err(TableError::NotReady) => {
                    warn!(
                        path = %path.display(),
                        "ports configuration is still being written, skipping reload"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "keeping previous ports configuration");
                }
            }
        })
        .await;
    })
}

pub fn spawn_hosts_watcher(path: PathBuf, tables: Arc<LiveTables>) -> JoinHandle<()> {
    spawn_hosts_watcher_with_interval(path, tables, DEFAULT_POLL_INTERVAL)
}

pub fn spawn_hosts_watcher_with_interval(
    path: PathBuf,
    tables: Arc<LiveTables>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        watch_file(&path, interval, || {
            info!(path = %path.display(), "hosts configuration changed, reloading");
            match load_hosts_table(&path) {
                Ok(table) => tables.publish_hosts(table),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "keeping previous hosts configuration");
                }
            }
        })
        .await;
    })
}

/// Reload the cluster mapping and reconcile the listener registry on each
/// SIGHUP. The registry is owned by this task from here on.
pub fn spawn_cluster_reloader(
    path: PathBuf,
    tables: Arc<LiveTables>,
    mut registry: ListenerRegistry,
) -> io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "received SIGHUP, reloading cluster mapping");
            match load_cluster_map(&path) {
                Ok(next) => {
                    let previous = tables.cluster();
                    let failures = registry.reconcile(&previous, &next).await;
                    if !failures.is_empty() {
                        warn!(
                            failed_ports = failures.len(),
                            "some mapped-port listeners failed to bind"
                        );
                    }
                    tables.publish_cluster(next);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "keeping previous cluster mapping");
                }
            }
        }
    }))
}

fn stat(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some((modified, metadata.len()))
}

/// Poll `stat` forever, firing the callback whenever modification time or
/// size differs from the last observation.
async fn watch_file<F>(path: &Path, interval: Duration, mut on_change: F)
where
    F: FnMut(),
{
    let mut last = stat(path);
    if last.is_none() {
        warn!(path = %path.display(), "cannot stat watched file, waiting for it to appear");
    }

    loop {
        tokio::time::sleep(interval).await;
        let now = stat(path);
        if now != last {
            last = now;
            on_change();
        }
    }
}
