//! Cluster relay node.
//!
//! L4 TCP relay speaking the HAProxy PROXY protocol v1 on both ingress and
//! egress. This binary:
//! - Accepts peer-proxy connections on a control port and routes them to
//!   local backends by proxy-port
//! - Accepts connections on a range of cluster ports and forwards them to
//!   the first reachable peer host
//! - Hot-swaps its routing tables when the configuration files change,
//!   without tearing down established relays

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cluster_proxy::proxy::{
    ClusterListener, ConnectionCounters, ControlListener, HostRelay, ListenerRegistry, MappedRelay,
    Router,
};
use cluster_proxy::reload;
use cluster_proxy::settings::{ProgramSettings, DEFAULT_SETTINGS_PATH};
use cluster_proxy::tables::{load_cluster_map, load_hosts_table, load_ports_table, LiveTables};

/// Cluster relay node speaking the HAProxy PROXY protocol v1.
#[derive(Debug, Parser)]
#[command(name = "proxy", version)]
struct Cli {
    /// Host used to bind mapped-port listeners and dial local backends.
    #[arg(default_value = "localhost")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ProgramSettings::load(Path::new(DEFAULT_SETTINGS_PATH))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host = %cli.host,
        configuration_file = %settings.configuration_file.display(),
        ports_configuration_file = %settings.ports_configuration_file.display(),
        hosts_configuration_file = %settings.hosts_configuration_file.display(),
        listener_host = %settings.listener_host,
        listener_port = settings.listener_port,
        cluster_ports_range_min = settings.cluster_ports_range_min,
        cluster_ports_range_max = settings.cluster_ports_range_max,
        "settings loaded"
    );

    let cluster = load_cluster_map(&settings.configuration_file)
        .context("invalid initial cluster-mapping configuration")?;
    let routing = load_ports_table(&settings.ports_configuration_file)
        .context("expected initial ports configuration to be valid")?;
    let hosts = load_hosts_table(&settings.hosts_configuration_file)
        .context("invalid initial hosts configuration")?;

    let tables = Arc::new(LiveTables::new(routing, hosts, cluster));
    let counters = Arc::new(ConnectionCounters::new());

    // Control listener feeding the routing engine.
    let router = Arc::new(Router::new(
        Arc::clone(&tables),
        Arc::clone(&counters),
        cli.host.clone(),
    ));
    let control = ControlListener::bind(&settings.listener_host, settings.listener_port, router)
        .await
        .context("failed to bind control listener")?;
    tokio::spawn(control.run());

    // Host-role listeners on the cluster-port range.
    let host_relay = Arc::new(HostRelay::new(Arc::clone(&tables), Arc::clone(&counters)));
    for port in settings.cluster_ports_range_min..=settings.cluster_ports_range_max {
        let listener = ClusterListener::bind(&settings.listener_host, port, Arc::clone(&host_relay))
            .await
            .with_context(|| format!("failed to bind cluster listener on port {port}"))?;
        tokio::spawn(listener.run());
    }
    info!(
        range_min = settings.cluster_ports_range_min,
        range_max = settings.cluster_ports_range_max,
        "cluster listeners bound"
    );

    // Mapped-port listeners from the cluster-mapping table.
    let mapped_relay = Arc::new(MappedRelay::new(
        Arc::clone(&tables),
        Arc::clone(&counters),
        cli.host.clone(),
    ));
    let mut registry = ListenerRegistry::new(cli.host.clone(), mapped_relay);
    let failures = registry
        .reconcile(&Default::default(), &tables.cluster())
        .await;
    if !failures.is_empty() {
        bail!(
            "failed to bind mapped-port listeners: {:?}",
            failures.iter().map(|(port, _)| *port).collect::<Vec<_>>()
        );
    }

    reload::spawn_ports_watcher(settings.ports_configuration_file.clone(), Arc::clone(&tables));
    reload::spawn_hosts_watcher(settings.hosts_configuration_file.clone(), Arc::clone(&tables));
    reload::spawn_cluster_reloader(
        settings.configuration_file.clone(),
        Arc::clone(&tables),
        registry,
    )
    .context("failed to install SIGHUP handler")?;

    info!("relay node running");
    std::future::pending::<()>().await;
    Ok(())
}
