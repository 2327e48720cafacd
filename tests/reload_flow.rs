//! End-to-end reload behavior: the mid-write skip on the ports file and the
//! mapped-port listener reconcile.


use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use cluster_proxy::proxy::{ConnectionCounters, ListenerRegistry, MappedRelay};
use cluster_proxy::reload::spawn_ports_watcher_with_interval;
use cluster_proxy::tables::{
    load_ports_table, parse_cluster_map, ClusterMap, HostsTable, LiveTables, RoutingTable,
};

use harness::{closed_port, read_reply, send_header, wait_for, RecordingEchoBackend, RelayHandle};

fn write_file(path: &Path, contents: &str) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

#[tokio::test]
async fn test_mid_write_reload_is_skipped_until_sentinel_lands() {
    let before = RecordingEchoBackend::spawn().await.unwrap();
    let after = RecordingEchoBackend::spawn().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ports.conf");
    write_file(
        &path,
        &format!("8080:{}:10:false\n### EOF\n", before.addr.port()),
    );

    let relay = RelayHandle::spawn(load_ports_table(&path).unwrap())
        .await
        .unwrap();

    let watcher = spawn_ports_watcher_with_interval(
        path.clone(),
        Arc::clone(&relay.tables),
        Duration::from_millis(20),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A half-written file (no sentinel) must leave the live table alone.
    write_file(&path, &format!("8080:{}:10:false\n", after.addr.port()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TcpStream::connect(relay.control_addr).await.unwrap();
    send_header(&mut client, "1.2.3.4", "5.6.7.8", 1111, 8080)
        .await
        .unwrap();
    assert_eq!(read_reply(&mut client).await.unwrap(), "go ahead\n");
    client.write_all(b"old table").await.unwrap();
    wait_for(|| { before.received_bytes() == b"old table" }).await;

    // Completing the file makes the next accept see the new table.
    write_file(
        &path,
        &format!("8080:{}:10:false\n### EOF\n", after.addr.port()),
    );
    let after_port = after.addr.port();
    wait_for(|| {
        relay
            .tables
            .routing()
            .lookup(8080)
            .map(|backends| backends[0].host_port == after_port)
            .unwrap_or(false)
    })
    .await;

    let mut client = TcpStream::connect(relay.control_addr).await.unwrap();
    send_header(&mut client, "1.2.3.4", "5.6.7.8", 2222, 8080)
        .await
        .unwrap();
    assert_eq!(read_reply(&mut client).await.unwrap(), "go ahead\n");
    client.write_all(b"new table").await.unwrap();
    wait_for(|| { after.received_bytes() == b"new table" }).await;

    watcher.abort();
}

#[tokio::test]
async fn test_reconcile_relays_through_mapped_port() {
    let backend = RecordingEchoBackend::spawn().await.unwrap();
    let in_port = closed_port();

    let tables = Arc::new(LiveTables::new(
        RoutingTable::default(),
        HostsTable::default(),
        ClusterMap::default(),
    ));
    let relay = Arc::new(MappedRelay::new(
        Arc::clone(&tables),
        Arc::new(ConnectionCounters::new()),
        "127.0.0.1".to_string(),
    ));

    let map = parse_cluster_map(&format!("{in_port}:[{}]\n", backend.addr.port())).unwrap();
    let mut registry = ListenerRegistry::new("127.0.0.1".to_string(), relay);
    let failures = registry.reconcile(&ClusterMap::default(), &map).await;
    assert!(failures.is_empty());
    tables.publish_cluster(map.clone());

    let mut client = TcpStream::connect(("127.0.0.1", in_port)).await.unwrap();
    client.write_all(b"through the mapping").await.unwrap();
    wait_for(|| { backend.received_bytes() == b"through the mapping" }).await;

    // An identical reload must not disturb the established relay or the
    // listener itself.
    let failures = registry.reconcile(&map, &map).await;
    assert!(failures.is_empty());

    client.write_all(b"!").await.unwrap();
    wait_for(|| { backend.received_bytes() == b"through the mapping!" }).await;

    let mut second = TcpStream::connect(("127.0.0.1", in_port)).await.unwrap();
    second.write_all(b"?").await.unwrap();
    wait_for(|| { backend.received_bytes() == b"through the mapping!?" }).await;

    // Dropping the mapping closes the listener; established relays survive.
    let failures = registry.reconcile(&map, &ClusterMap::default()).await;
    assert!(failures.is_empty());
    assert!(registry.ports().is_empty());

    client.write_all(b"still here").await.unwrap();
    wait_for(|| {
        backend.received_bytes() == b"through the mapping!?still here"
    })
    .await;

    assert!(TcpStream::connect(("127.0.0.1", in_port)).await.is_err());

    // Read back an echo so the sockets stay honest.
    let mut echoed = [0u8; 1];
    second.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"?");
}
