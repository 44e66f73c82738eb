//! Fleet and server lifecycle scenarios.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tile_fleet::common::config::{FleetInfo, ServerSettings};
use tile_fleet::common::connection::Connection;
use tile_fleet::common::error::{CapacityError, ServerError};
use tile_fleet::common::events::{null_sink, Event};
use tile_fleet::common::messages::{Request, Response};
use tile_fleet::processing::{codec, Transform};
use tile_fleet::registry::LoadRegistry;
use tile_fleet::server::{ComputeServer, Fleet};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A base port with `count` free ports above it.
async fn free_port_range(count: u16) -> u16 {
    'search: loop {
        let base = free_port().await;
        if base.checked_add(count).is_none() {
            continue;
        }
        for offset in 0..count {
            if TcpListener::bind(("127.0.0.1", base + offset)).await.is_err() {
                continue 'search;
            }
        }
        return base;
    }
}

fn checker() -> image::RgbaImage {
    image::RgbaImage::from_fn(4, 2, |x, y| {
        if (x + y) % 2 == 0 {
            image::Rgba([255, 0, 0, 255])
        } else {
            image::Rgba([0, 0, 255, 255])
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_removes_registry_entry() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LoadRegistry::open(dir.path().join("load")).await.unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let port = free_port().await;
    let server = ComputeServer::new("Server 1", port, 2, Transform::Identity, registry.clone(), Arc::new(tx));

    server.start().await.unwrap();
    assert_eq!(registry.get_load(port).await.unwrap(), Some(0));
    server.close().await.unwrap();
    assert_eq!(registry.get_load(port).await.unwrap(), None);

    let lifecycle: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|event| !matches!(event, Event::LoadUpdated { .. }))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            Event::ServerStarting { name: "Server 1".into(), port },
            Event::ServerRunning { name: "Server 1".into(), port },
            Event::ServerClosed { name: "Server 1".into(), port },
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_keeps_server_alive() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LoadRegistry::open(dir.path().join("load")).await.unwrap());
    let port = free_port().await;
    let server = ComputeServer::new("Server 1", port, 1, Transform::Identity, registry, null_sink());
    server.start().await.unwrap();

    // Oversized length prefix, then a closed socket.
    let mut bad = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    bad.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    drop(bad);

    let image = checker();
    let mut conn = Connection::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    conn.write_message(&Request::process("after garbage", codec::encode_png(&image).unwrap()))
        .await
        .unwrap();
    let response: Response = tokio::time::timeout(Duration::from_secs(5), conn.read_message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(codec::decode(&response.image).unwrap(), image);

    drop(conn);
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fleet_respects_capacity_bounds() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(LoadRegistry::open(dir.path().join("load")).await.unwrap());
    let info = FleetInfo {
        server_count: 1,
        max_servers: 2,
        start_port: free_port_range(2).await,
        pool_size: 1,
        registry_path: registry.path().to_path_buf(),
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let fleet = Fleet::new(info, ServerSettings::default(), registry.clone(), Arc::new(tx));

    fleet.start().await.unwrap();
    fleet.add_server().await.unwrap();
    assert_eq!(registry.entries().await.unwrap().len(), 2);

    let over = fleet.add_server().await;
    assert!(matches!(over, Err(ServerError::Capacity(CapacityError::MaxServers { max: 2 }))));

    fleet.remove_last_server().await.unwrap();
    let under = fleet.remove_last_server().await;
    assert!(matches!(under, Err(ServerError::Capacity(CapacityError::MinServers { min: 1 }))));
    assert_eq!(registry.entries().await.unwrap().len(), 1);

    fleet.close_all().await.unwrap();
    assert!(registry.entries().await.unwrap().is_empty());

    let warnings = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|event| matches!(event, Event::Warning { .. }))
        .count();
    assert_eq!(warnings, 2);
}
